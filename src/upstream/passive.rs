use crate::config::PassiveHealthConfig;
use crate::upstream::pool::Upstream;
use std::time::Duration;
use tracing::{debug, warn};

/// Inline health observation: called by the forwarder after every attempt
/// with the response status (0 for transport failures) and measured latency.
pub struct PassiveHealth {
    cfg: PassiveHealthConfig,
}

impl PassiveHealth {
    pub fn new(cfg: PassiveHealthConfig) -> Self {
        Self { cfg }
    }

    /// Whether this outcome counts as a failure. Client cancellations never
    /// reach this point — the forwarder filters them out.
    fn is_failure(&self, status: u16, latency: Duration) -> bool {
        if status == 0 {
            return true;
        }
        if self.cfg.unhealthy_statuses.contains(status) {
            return true;
        }
        !self.cfg.unhealthy_latency.is_zero() && latency >= self.cfg.unhealthy_latency
    }

    pub fn observe(&self, upstream: &Upstream, status: u16, latency: Duration) {
        if !self.is_failure(status, latency) {
            return;
        }
        self.count_failure(upstream, status, latency);
    }

    /// Bump the host's failure counter and, when decay is configured, arm a
    /// single-shot timer that takes the failure back off. Each increment
    /// gets its own timer, so N quick failures decay N times.
    pub fn count_failure(&self, upstream: &Upstream, status: u16, latency: Duration) {
        let host = upstream.host().clone();
        match host.add_fails(1) {
            Ok(fails) => {
                debug!(
                    "health: passive: failure counted, upstream={}, status={}, latency={:?}, fails={}",
                    upstream.addr(),
                    status,
                    latency,
                    fails
                );
            }
            Err(e) => {
                warn!("health: passive: {}", e);
                return;
            }
        }

        let fail_duration = self.cfg.fail_duration;
        if fail_duration.is_zero() {
            return;
        }
        tokio::spawn(async move {
            tokio::time::sleep(fail_duration).await;
            if let Err(e) = host.add_fails(-1) {
                debug!("health: passive: decay skipped, {}", e);
            }
        });
    }
}
