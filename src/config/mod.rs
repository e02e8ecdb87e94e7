pub mod types;


pub use types::*;

use anyhow::Result;
use std::path::Path;

const KNOWN_POLICIES: &[&str] = &[
    "random",
    "random_choose",
    "least_requests",
    "round_robin",
    "weighted_round_robin",
    "first_available",
    "ip_hash",
    "uri_hash",
    "query_hash",
    "header_hash",
    "cookie_hash",
];

impl ProxyConfig {
    /// Load configuration from a TOML or JSON file and apply environment
    /// variable overrides for the listener addresses.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: ProxyConfig = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&content)?,
            Some("json") => serde_json::from_str(&content)?,
            Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
            None => anyhow::bail!("config file has no extension, use .toml or .json"),
        };

        config.apply_env_overrides();
        config.validate()?;
        tracing::info!("config: loaded, path={}", path.display());
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("CHARON_LISTEN") {
            self.listen = v;
        }
        if let Ok(v) = std::env::var("CHARON_ADMIN_LISTEN") {
            self.admin_listen = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.proxy.validate()
    }
}

impl HandlerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.upstreams.is_empty() {
            anyhow::bail!("at least one upstream is required");
        }
        for up in &self.upstreams {
            if up.dial.is_empty() {
                anyhow::bail!("upstream dial address cannot be empty");
            }
        }

        let policy = self.selection.policy.as_str();
        if !KNOWN_POLICIES.contains(&policy) {
            anyhow::bail!("unknown selection policy {:?}", policy);
        }
        if matches!(policy, "query_hash" | "header_hash" | "cookie_hash")
            && self.selection.field.is_empty()
        {
            anyhow::bail!("selection policy {:?} requires a field", policy);
        }
        if policy == "random_choose" && self.selection.choose < 2 {
            anyhow::bail!("random_choose requires choose >= 2");
        }
        if !KNOWN_POLICIES.contains(&self.selection.fallback.as_str()) {
            anyhow::bail!("unknown fallback policy {:?}", self.selection.fallback);
        }

        let versions = &self.transport.versions;
        if versions.is_empty() {
            anyhow::bail!("transport.versions cannot be empty");
        }
        for v in versions {
            match v.as_str() {
                "1.1" | "2" | "h2c" => {}
                "3" => anyhow::bail!("HTTP/3 upstreams are not supported by this build"),
                other => anyhow::bail!("unknown HTTP version {:?}", other),
            }
        }

        match self.transport.proxy_protocol.as_str() {
            "" | "v1" | "v2" => {}
            other => anyhow::bail!("unknown proxy_protocol {:?}, use \"v1\" or \"v2\"", other),
        }

        if let Some(cb) = &self.circuit_breaker {
            match cb.factor.as_str() {
                "latency" | "error_ratio" | "status_ratio" => {}
                other => anyhow::bail!("unknown circuit breaker factor {:?}", other),
            }
            if cb.factor == "latency" && !(cb.percentile > 0.0 && cb.percentile < 1.0) {
                anyhow::bail!("circuit breaker percentile must be in (0, 1)");
            }
        }

        for cidr in &self.trusted_proxies {
            cidr.parse::<ipnetwork::IpNetwork>()
                .map_err(|e| anyhow::anyhow!("bad trusted_proxies entry {:?}: {}", cidr, e))?;
        }

        for op in self.headers.request.iter().chain(&self.headers.response) {
            match op.action.as_str() {
                "set" | "add" | "remove" => {}
                other => anyhow::bail!("unknown header action {:?}", other),
            }
        }

        Ok(())
    }
}
