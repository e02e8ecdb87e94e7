use crate::config::ActiveHealthConfig;
use crate::error::ProxyError;
use crate::upstream::pool::{DialAddress, Upstream, UpstreamPool};
use futures_util::stream::{self, StreamExt};
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

enum HeaderCheck {
    Exact(String, String),
    Pattern(String, Regex),
}

/// Out-of-band prober: one worker per pool, ticking at the configured
/// interval, fanning probes out with bounded concurrency. Probe outcomes
/// drive the host's active-health bit through consecutive pass/fail streaks.
pub struct ActiveHealthChecker {
    pool: Arc<UpstreamPool>,
    cfg: ActiveHealthConfig,
    client: reqwest::Client,
    scheme: &'static str,
    expect_body: Option<Regex>,
    expect_headers: Vec<HeaderCheck>,
}

impl ActiveHealthChecker {
    pub fn new(
        pool: Arc<UpstreamPool>,
        cfg: ActiveHealthConfig,
        tls: bool,
        insecure: bool,
    ) -> Result<Self, ProxyError> {
        let expect_body = cfg
            .expect_body
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| ProxyError::Config(format!("bad expect_body regex: {}", e)))?;

        let mut expect_headers = Vec::with_capacity(cfg.expect_headers.len());
        for h in &cfg.expect_headers {
            expect_headers.push(if h.regex {
                let re = Regex::new(&h.value).map_err(|e| {
                    ProxyError::Config(format!("bad expect_headers regex for {}: {}", h.name, e))
                })?;
                HeaderCheck::Pattern(h.name.clone(), re)
            } else {
                HeaderCheck::Exact(h.name.clone(), h.value.clone())
            });
        }

        let client = reqwest::Client::builder()
            .timeout(cfg.timeout + Duration::from_secs(1))
            .danger_accept_invalid_certs(insecure)
            .no_proxy()
            .build()
            .map_err(|e| ProxyError::Config(format!("health check client: {}", e)))?;

        Ok(Self {
            pool,
            cfg,
            client,
            scheme: if tls { "https" } else { "http" },
            expect_body,
            expect_headers,
        })
    }

    /// Worker loop. Cancelling via `shutdown` also aborts whatever probes
    /// are still in flight for the current round.
    pub async fn run(self: Arc<Self>, shutdown: Arc<Notify>) {
        let mut interval = tokio::time::interval(self.cfg.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let notified = shutdown.notified();
        tokio::pin!(notified);

        tokio::select! {
            _ = &mut notified => {
                debug!("health: active: worker stopped");
            }
            _ = async {
                loop {
                    interval.tick().await;
                    self.probe_round().await;
                }
            } => {}
        }
    }

    pub async fn probe_round(&self) {
        stream::iter(self.pool.iter())
            .map(|upstream| self.probe_one(upstream))
            .buffer_unordered(self.cfg.concurrency.max(1))
            .collect::<()>()
            .await;
    }

    async fn probe_one(&self, upstream: &Upstream) {
        let (host, port) = match upstream.dial() {
            DialAddress::Tcp { host, port } => (host.clone(), *port),
            DialAddress::Unix(_) => {
                // The probe client only speaks TCP; unix upstreams rely on
                // passive checks.
                return;
            }
        };
        let probe_port = self.cfg.port.unwrap_or(port);
        let url = format!("{}://{}:{}{}", self.scheme, host, probe_port, self.cfg.path);

        match self.probe_url(&url).await {
            Ok(()) => self.record_pass(upstream),
            Err(e) => self.record_fail(upstream, &e),
        }
    }

    /// Runs the probe and evaluates every configured expectation. All must
    /// hold for a pass.
    async fn probe_url(&self, url: &str) -> Result<(), ProxyError> {
        let mut req = self
            .client
            .get(url)
            .timeout(self.cfg.timeout);
        if let Some(host) = &self.cfg.host {
            req = req.header(http::header::HOST, host.as_str());
        }
        for h in &self.cfg.headers {
            req = req.header(h.name.as_str(), h.value.as_str());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| ProxyError::HealthProbe(e.to_string()))?;

        let status = resp.status().as_u16();
        if !self.cfg.expect_status.contains(status) {
            return Err(ProxyError::HealthProbe(format!(
                "unexpected status {}",
                status
            )));
        }

        for check in &self.expect_headers {
            let (name, ok) = match check {
                HeaderCheck::Exact(name, want) => (
                    name,
                    resp.headers()
                        .get(name)
                        .and_then(|v| v.to_str().ok())
                        .is_some_and(|v| v == want),
                ),
                HeaderCheck::Pattern(name, re) => (
                    name,
                    resp.headers()
                        .get(name)
                        .and_then(|v| v.to_str().ok())
                        .is_some_and(|v| re.is_match(v)),
                ),
            };
            if !ok {
                return Err(ProxyError::HealthProbe(format!(
                    "header {} did not match expectation",
                    name
                )));
            }
        }

        if let Some(re) = &self.expect_body {
            let body = self.read_bounded_body(resp).await?;
            if !re.is_match(&body) {
                return Err(ProxyError::HealthProbe(
                    "body did not match expect_body".to_string(),
                ));
            }
        }

        Ok(())
    }

    async fn read_bounded_body(&self, mut resp: reqwest::Response) -> Result<String, ProxyError> {
        let mut collected = Vec::new();
        while let Some(chunk) = resp
            .chunk()
            .await
            .map_err(|e| ProxyError::HealthProbe(e.to_string()))?
        {
            let remaining = self.cfg.max_size.saturating_sub(collected.len());
            if remaining == 0 {
                break;
            }
            collected.extend_from_slice(&chunk[..chunk.len().min(remaining)]);
            if collected.len() >= self.cfg.max_size {
                break;
            }
        }
        Ok(String::from_utf8_lossy(&collected).into_owned())
    }

    fn record_pass(&self, upstream: &Upstream) {
        let streak = upstream.host().count_pass();
        metrics::counter!(
            "proxy_health_check_total",
            "upstream" => upstream.addr().to_string(),
            "result" => "success",
        )
        .increment(1);

        if streak >= self.cfg.pass_threshold as i64 && upstream.host().set_healthy(true) {
            info!(
                event = "active_healthy",
                upstream = upstream.addr(),
                "health: active: upstream became healthy"
            );
            metrics::gauge!(
                "proxy_upstreams_healthy",
                "upstream" => upstream.addr().to_string(),
            )
            .set(1.0);
        }
    }

    fn record_fail(&self, upstream: &Upstream, err: &ProxyError) {
        let streak = upstream.host().count_fail();
        metrics::counter!(
            "proxy_health_check_total",
            "upstream" => upstream.addr().to_string(),
            "result" => "failure",
        )
        .increment(1);
        debug!(
            "health: active: probe failed, upstream={}, streak={}, error={}",
            upstream.addr(),
            streak,
            err
        );

        if streak >= self.cfg.fail_threshold as i64 && upstream.host().set_healthy(false) {
            warn!(
                event = "active_unhealthy",
                upstream = upstream.addr(),
                "health: active: upstream became unhealthy"
            );
            metrics::gauge!(
                "proxy_upstreams_healthy",
                "upstream" => upstream.addr().to_string(),
            )
            .set(0.0);
        }
    }
}

/// Refreshes the per-upstream health gauge every 10 seconds so the metric
/// stays correct even when no transitions happen.
pub fn spawn_health_gauge_reporter(pool: Arc<UpstreamPool>, shutdown: Arc<Notify>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(10));
        loop {
            tokio::select! {
                _ = shutdown.notified() => return,
                _ = interval.tick() => {}
            }
            for upstream in pool.iter() {
                metrics::gauge!(
                    "proxy_upstreams_healthy",
                    "upstream" => upstream.addr().to_string(),
                )
                .set(if upstream.healthy() { 1.0 } else { 0.0 });
            }
        }
    });
}
