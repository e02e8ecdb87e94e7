use crate::config::CircuitBreakerConfig;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// What a breaker trips on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TripFactor {
    /// Trip when the configured latency quantile exceeds `threshold` ms.
    Latency { percentile: f64, threshold_ms: f64 },
    /// Trip when the share of transport errors exceeds the threshold.
    ErrorRatio(f64),
    /// Trip when the share of 5xx responses exceeds the threshold.
    StatusRatio(f64),
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    latency: Duration,
    status: u16,
    /// Transport-level failure; `status` is 0 for these.
    errored: bool,
}

/// Per-upstream rolling-window breaker. `record()` is called once per
/// completed attempt; `ok()` is consulted on every selection, so the tripped
/// state lives in an atomic while the sample window sits behind a mutex.
pub struct CircuitBreaker {
    factor: TripFactor,
    window: Duration,
    trip_time: Duration,
    samples: Mutex<VecDeque<Sample>>,
    /// Millis since `epoch` until which the breaker is open; 0 = closed.
    tripped_until_ms: AtomicU64,
    epoch: Instant,
    addr: String,
}

impl CircuitBreaker {
    pub fn new(cfg: &CircuitBreakerConfig, addr: &str) -> Self {
        let factor = match cfg.factor.as_str() {
            "error_ratio" => TripFactor::ErrorRatio(cfg.threshold),
            "status_ratio" => TripFactor::StatusRatio(cfg.threshold),
            _ => TripFactor::Latency {
                percentile: cfg.percentile,
                threshold_ms: cfg.threshold,
            },
        };
        Self {
            factor,
            window: cfg.window,
            trip_time: cfg.trip_time,
            samples: Mutex::new(VecDeque::new()),
            tripped_until_ms: AtomicU64::new(0),
            epoch: Instant::now(),
            addr: addr.to_string(),
        }
    }

    /// Whether requests may flow. When a cooldown expires the window is
    /// cleared so stale samples cannot immediately re-trip.
    pub fn ok(&self) -> bool {
        let until = self.tripped_until_ms.load(Ordering::Acquire);
        if until == 0 {
            return true;
        }
        if self.now_ms() < until {
            return false;
        }
        if self
            .tripped_until_ms
            .compare_exchange(until, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.samples.lock().unwrap().clear();
            tracing::info!("circuit_breaker: closed, upstream={}", self.addr);
        }
        true
    }

    /// Record the outcome of one attempt. `status == 0` marks a transport
    /// failure.
    pub fn record(&self, status: u16, latency: Duration) {
        let now = Instant::now();
        let tripped = {
            let mut samples = self.samples.lock().unwrap();
            samples.push_back(Sample {
                at: now,
                latency,
                status,
                errored: status == 0,
            });
            while let Some(front) = samples.front() {
                if now.duration_since(front.at) > self.window {
                    samples.pop_front();
                } else {
                    break;
                }
            }
            self.should_trip(&samples)
        };

        if tripped && self.tripped_until_ms.load(Ordering::Acquire) == 0 {
            let until = self.now_ms() + self.trip_time.as_millis() as u64;
            self.tripped_until_ms.store(until, Ordering::Release);
            tracing::warn!(
                "circuit_breaker: tripped, upstream={}, cooldown={:?}",
                self.addr,
                self.trip_time
            );
        }
    }

    fn should_trip(&self, samples: &VecDeque<Sample>) -> bool {
        if samples.is_empty() {
            return false;
        }
        match self.factor {
            TripFactor::Latency {
                percentile,
                threshold_ms,
            } => {
                let mut latencies: Vec<f64> = samples
                    .iter()
                    .filter(|s| !s.errored)
                    .map(|s| s.latency.as_secs_f64() * 1000.0)
                    .collect();
                if latencies.is_empty() {
                    return false;
                }
                latencies.sort_by(|a, b| a.total_cmp(b));
                let rank = ((latencies.len() as f64) * percentile).ceil() as usize;
                let idx = rank.clamp(1, latencies.len()) - 1;
                latencies[idx] >= threshold_ms
            }
            TripFactor::ErrorRatio(threshold) => {
                let errors = samples.iter().filter(|s| s.errored).count();
                errors as f64 / samples.len() as f64 >= threshold
            }
            TripFactor::StatusRatio(threshold) => {
                let bad = samples
                    .iter()
                    .filter(|s| (500..600).contains(&s.status))
                    .count();
                bad as f64 / samples.len() as f64 >= threshold
            }
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(factor: &str, threshold: f64, trip_ms: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            factor: factor.to_string(),
            threshold,
            percentile: 0.5,
            trip_time: Duration::from_millis(trip_ms),
            window: Duration::from_secs(10),
        }
    }

    #[test]
    fn test_starts_closed() {
        let cb = CircuitBreaker::new(&config("latency", 100.0, 1000), "a:80");
        assert!(cb.ok());
    }

    #[test]
    fn test_latency_quantile_trips() {
        let cb = CircuitBreaker::new(&config("latency", 100.0, 60_000), "a:80");
        // Median well under threshold: stays closed.
        for _ in 0..10 {
            cb.record(200, Duration::from_millis(10));
        }
        assert!(cb.ok());
        // Push the median over 100ms.
        for _ in 0..20 {
            cb.record(200, Duration::from_millis(500));
        }
        assert!(!cb.ok());
    }

    #[test]
    fn test_error_ratio_trips() {
        let cb = CircuitBreaker::new(&config("error_ratio", 0.5, 60_000), "a:80");
        cb.record(200, Duration::from_millis(1));
        cb.record(200, Duration::from_millis(1));
        cb.record(0, Duration::from_millis(1));
        assert!(cb.ok()); // 1/3 < 0.5
        cb.record(0, Duration::from_millis(1));
        assert!(!cb.ok()); // 2/4 >= 0.5
    }

    #[test]
    fn test_status_ratio_trips() {
        let cb = CircuitBreaker::new(&config("status_ratio", 0.5, 60_000), "a:80");
        cb.record(200, Duration::from_millis(1));
        cb.record(502, Duration::from_millis(1));
        assert!(!cb.ok());
    }

    #[test]
    fn test_cooldown_recovers_and_resets_window() {
        let cb = CircuitBreaker::new(&config("error_ratio", 0.5, 20), "a:80");
        cb.record(0, Duration::from_millis(1));
        assert!(!cb.ok());

        std::thread::sleep(Duration::from_millis(30));
        // Cooldown elapsed: closed again, and the old samples are gone so a
        // single success keeps it closed.
        assert!(cb.ok());
        cb.record(200, Duration::from_millis(1));
        assert!(cb.ok());
    }

    #[test]
    fn test_latency_ignores_errored_samples() {
        let cb = CircuitBreaker::new(&config("latency", 100.0, 60_000), "a:80");
        // Transport errors carry no meaningful latency for the quantile.
        cb.record(0, Duration::from_secs(10));
        assert!(cb.ok());
    }
}
