use crate::config::{PassiveHealthConfig, UpstreamConfig};
use crate::error::ProxyError;
use crate::upstream::circuit_breaker::CircuitBreaker;
use crate::upstream::host::Host;
use std::fmt;
use std::sync::Arc;

/// Parsed form of an upstream `dial` string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DialAddress {
    Tcp { host: String, port: u16 },
    Unix(String),
}

impl DialAddress {
    /// Parse "host:port" or "unix/<path>". The dynamic `srv+`/`a+` prefixes
    /// used by DNS-driven deployments are recognized but not supported here.
    pub fn parse(dial: &str) -> Result<Self, ProxyError> {
        if let Some(path) = dial.strip_prefix("unix/") {
            if path.is_empty() {
                return Err(ProxyError::Config(format!("bad unix dial {:?}", dial)));
            }
            return Ok(DialAddress::Unix(path.to_string()));
        }
        if dial.starts_with("srv+") || dial.starts_with("a+") {
            return Err(ProxyError::Config(format!(
                "dynamic upstream address {:?} is not supported",
                dial
            )));
        }
        // Allow an optional scheme prefix ("http://host:port").
        let trimmed = dial
            .strip_prefix("http://")
            .or_else(|| dial.strip_prefix("https://"))
            .unwrap_or(dial);
        let (host, port) = trimmed
            .rsplit_once(':')
            .ok_or_else(|| ProxyError::Config(format!("dial {:?} needs host:port", dial)))?;
        if host.is_empty() {
            return Err(ProxyError::Config(format!("dial {:?} needs a host", dial)));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| ProxyError::Config(format!("bad port in dial {:?}", dial)))?;
        Ok(DialAddress::Tcp {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for DialAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DialAddress::Tcp { host, port } => write!(f, "{}:{}", host, port),
            DialAddress::Unix(path) => write!(f, "unix/{}", path),
        }
    }
}

/// Resolved destination for one forwarding attempt. Built at selection time
/// and consumed by the transport's dial step; overrides whatever host/port
/// the request URI carries.
#[derive(Debug, Clone)]
pub struct DialInfo {
    pub address: DialAddress,
    /// Upstream identity for logging and passive bookkeeping.
    pub upstream_addr: Arc<str>,
}

impl DialInfo {
    pub fn new(upstream: &Upstream) -> Self {
        Self {
            address: upstream.dial.clone(),
            upstream_addr: upstream.addr.clone(),
        }
    }
}

/// One pool entry: static configuration bound to the shared per-address
/// `Host` state.
#[derive(Clone)]
pub struct Upstream {
    dial: DialAddress,
    /// Canonical dial string; registry key and log identity.
    addr: Arc<str>,
    max_requests: usize,
    weight: u32,
    host: Arc<Host>,
    /// Passive failure count at which selection skips this upstream.
    /// Zero disables the passive check.
    max_fails: i64,
    breaker: Option<Arc<CircuitBreaker>>,
}

impl Upstream {
    pub fn from_config(
        cfg: &UpstreamConfig,
        passive: Option<&PassiveHealthConfig>,
        breaker: Option<Arc<CircuitBreaker>>,
    ) -> Result<Self, ProxyError> {
        let dial = DialAddress::parse(&cfg.dial)?;
        let addr: Arc<str> = dial.to_string().into();
        let host = Host::acquire(&addr);

        // The passive config supplies a soft capacity for upstreams that
        // did not set their own cap.
        let mut max_requests = cfg.max_requests;
        if max_requests == 0 {
            if let Some(p) = passive {
                max_requests = p.unhealthy_request_count;
            }
        }

        Ok(Self {
            dial,
            addr,
            max_requests,
            weight: cfg.weight,
            host,
            max_fails: passive.map(|p| p.max_fails).unwrap_or(0),
            breaker,
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn dial(&self) -> &DialAddress {
        &self.dial
    }

    pub fn host(&self) -> &Arc<Host> {
        &self.host
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn max_requests(&self) -> usize {
        self.max_requests
    }

    pub fn breaker(&self) -> Option<&Arc<CircuitBreaker>> {
        self.breaker.as_ref()
    }

    pub fn num_requests(&self) -> i64 {
        self.host.num_requests()
    }

    /// Healthy means: not flagged by the active prober, below the passive
    /// failure limit, and the circuit breaker (if any) is closed.
    pub fn healthy(&self) -> bool {
        if !self.host.healthy() {
            return false;
        }
        if self.max_fails > 0 && self.host.fails() >= self.max_fails {
            return false;
        }
        if let Some(b) = &self.breaker {
            if !b.ok() {
                return false;
            }
        }
        true
    }

    /// Full means the per-upstream cap is configured and reached.
    pub fn full(&self) -> bool {
        self.max_requests > 0 && self.host.num_requests() >= self.max_requests as i64
    }

    pub fn available(&self) -> bool {
        self.healthy() && !self.full()
    }
}

impl fmt::Debug for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Upstream")
            .field("addr", &self.addr)
            .field("max_requests", &self.max_requests)
            .field("weight", &self.weight)
            .finish()
    }
}

/// Ordered, immutable collection of upstreams owned by one handler. Config
/// reloads build a whole new pool (and handler) and swap it in; the shared
/// `Host` entries carry state across the swap.
pub struct UpstreamPool {
    upstreams: Vec<Upstream>,
}

impl UpstreamPool {
    pub fn new(upstreams: Vec<Upstream>) -> Self {
        Self { upstreams }
    }

    pub fn len(&self) -> usize {
        self.upstreams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.upstreams.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Upstream> {
        self.upstreams.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Upstream> {
        self.upstreams.iter()
    }

    /// Sum of weights, used by weighted round-robin.
    pub fn total_weight(&self) -> u64 {
        self.upstreams
            .iter()
            .map(|u| u.weight.max(1) as u64)
            .sum()
    }
}

impl Drop for UpstreamPool {
    fn drop(&mut self) {
        // Drop the upstream handles first, then sweep registry entries whose
        // hosts this pool was the last holder of.
        self.upstreams.clear();
        crate::upstream::host::purge_dead_hosts();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PassiveHealthConfig;

    fn upstream(dial: &str, max_requests: usize) -> Upstream {
        Upstream::from_config(
            &UpstreamConfig {
                dial: dial.to_string(),
                max_requests,
                weight: 1,
            },
            None,
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_dial_parse_tcp() {
        assert_eq!(
            DialAddress::parse("10.0.0.1:8080").unwrap(),
            DialAddress::Tcp {
                host: "10.0.0.1".into(),
                port: 8080
            }
        );
        assert_eq!(
            DialAddress::parse("http://backend:80").unwrap(),
            DialAddress::Tcp {
                host: "backend".into(),
                port: 80
            }
        );
    }

    #[test]
    fn test_dial_parse_unix() {
        assert_eq!(
            DialAddress::parse("unix//run/app.sock").unwrap(),
            DialAddress::Unix("/run/app.sock".into())
        );
    }

    #[test]
    fn test_dial_parse_rejects_dynamic_and_garbage() {
        assert!(DialAddress::parse("srv+_http._tcp.svc").is_err());
        assert!(DialAddress::parse("a+backend.internal").is_err());
        assert!(DialAddress::parse("no-port").is_err());
        assert!(DialAddress::parse(":8080").is_err());
        assert!(DialAddress::parse("host:notaport").is_err());
    }

    #[test]
    fn test_full_at_cap() {
        let up = upstream("pool-full-test:80", 1);
        assert!(!up.full());
        assert!(up.available());

        up.host().add_requests(1).unwrap();
        assert!(up.full());
        assert!(up.healthy());
        assert!(!up.available());

        up.host().add_requests(-1).unwrap();
        assert!(up.available());
    }

    #[test]
    fn test_uncapped_never_full() {
        let up = upstream("pool-uncapped-test:80", 0);
        up.host().add_requests(1000).unwrap();
        assert!(!up.full());
        up.host().add_requests(-1000).unwrap();
    }

    #[test]
    fn test_passive_default_cap_applies() {
        let passive = PassiveHealthConfig {
            unhealthy_request_count: 2,
            ..Default::default()
        };
        let up = Upstream::from_config(
            &UpstreamConfig {
                dial: "pool-softcap-test:80".to_string(),
                max_requests: 0,
                weight: 1,
            },
            Some(&passive),
            None,
        )
        .unwrap();
        assert_eq!(up.max_requests(), 2);
    }

    #[test]
    fn test_passive_fails_gate_health() {
        let passive = PassiveHealthConfig {
            max_fails: 2,
            ..Default::default()
        };
        let up = Upstream::from_config(
            &UpstreamConfig {
                dial: "pool-fails-test:80".to_string(),
                max_requests: 0,
                weight: 1,
            },
            Some(&passive),
            None,
        )
        .unwrap();

        assert!(up.healthy());
        up.host().add_fails(1).unwrap();
        assert!(up.healthy());
        up.host().add_fails(1).unwrap();
        assert!(!up.healthy());
        assert!(!up.available());

        up.host().add_fails(-2).unwrap();
        assert!(up.healthy());
    }

    #[test]
    fn test_active_bit_gates_health() {
        let up = upstream("pool-activebit-test:80", 0);
        assert!(up.available());
        up.host().set_healthy(false);
        assert!(!up.available());
        up.host().set_healthy(true);
        assert!(up.available());
    }
}
