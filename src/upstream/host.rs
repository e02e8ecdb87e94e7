use crate::error::ProxyError;
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, Weak};

/// Shared per-address counters and health state. One `Host` exists per
/// distinct dial address process-wide, so the same backend referenced by
/// several pools (or by the pool before and after a reload) accumulates into
/// one set of counters.
#[derive(Debug, Default)]
pub struct Host {
    addr: String,
    num_requests: AtomicI64,
    fails: AtomicI64,
    active_passes: AtomicI64,
    active_fails: AtomicI64,
    /// 0 = healthy, 1 = marked unhealthy by the active prober.
    unhealthy: AtomicU32,
}

impl Host {
    /// Obtain the interned `Host` for `addr`, creating it on first use.
    /// Entries are held weakly: when the last pool drops its handle the host
    /// (and its counters) disappear.
    pub fn acquire(addr: &str) -> Arc<Host> {
        let registry = registry();
        if let Some(entry) = registry.get(addr) {
            if let Some(host) = entry.value().upgrade() {
                return host;
            }
        }
        // Either absent or dead — (re)insert under the entry lock so two
        // racing acquires agree on one instance.
        let entry = registry.entry(addr.to_string());
        match entry {
            dashmap::mapref::entry::Entry::Occupied(mut occ) => {
                if let Some(host) = occ.get().upgrade() {
                    return host;
                }
                let host = Arc::new(Host::new(addr));
                occ.insert(Arc::downgrade(&host));
                host
            }
            dashmap::mapref::entry::Entry::Vacant(vac) => {
                let host = Arc::new(Host::new(addr));
                vac.insert(Arc::downgrade(&host));
                host
            }
        }
    }

    fn new(addr: &str) -> Self {
        Self {
            addr: addr.to_string(),
            ..Default::default()
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn num_requests(&self) -> i64 {
        self.num_requests.load(Ordering::Relaxed)
    }

    pub fn fails(&self) -> i64 {
        self.fails.load(Ordering::Relaxed)
    }

    /// Adjust the in-flight request counter. A result that would go negative
    /// is clamped back and reported; the caller logs and continues.
    pub fn add_requests(&self, delta: i64) -> Result<i64, ProxyError> {
        self.add(&self.num_requests, delta, "num_requests")
    }

    /// Adjust the passive failure counter.
    pub fn add_fails(&self, delta: i64) -> Result<i64, ProxyError> {
        self.add(&self.fails, delta, "fails")
    }

    fn add(
        &self,
        counter: &AtomicI64,
        delta: i64,
        name: &'static str,
    ) -> Result<i64, ProxyError> {
        let result = counter.fetch_add(delta, Ordering::AcqRel) + delta;
        if result < 0 {
            counter.fetch_sub(delta, Ordering::AcqRel);
            return Err(ProxyError::CounterUnderflow {
                counter: name,
                addr: self.addr.clone(),
            });
        }
        Ok(result)
    }

    /// Record one active-probe pass; returns the pass streak length.
    pub fn count_pass(&self) -> i64 {
        self.active_fails.store(0, Ordering::Relaxed);
        self.active_passes.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Record one active-probe failure; returns the failure streak length.
    pub fn count_fail(&self) -> i64 {
        self.active_passes.store(0, Ordering::Relaxed);
        self.active_fails.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn healthy(&self) -> bool {
        self.unhealthy.load(Ordering::Acquire) == 0
    }

    /// Flip the active-health bit. Returns whether the stored value changed,
    /// so callers can emit transition events exactly once.
    pub fn set_healthy(&self, healthy: bool) -> bool {
        let (old, new) = if healthy { (1, 0) } else { (0, 1) };
        self.unhealthy
            .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

fn registry() -> &'static DashMap<String, Weak<Host>> {
    static REGISTRY: OnceLock<DashMap<String, Weak<Host>>> = OnceLock::new();
    REGISTRY.get_or_init(DashMap::new)
}

/// Drop registry entries whose hosts are gone. Called when a pool is torn
/// down so the map does not accumulate dead weak pointers across reloads.
pub fn purge_dead_hosts() {
    registry().retain(|_, weak| weak.strong_count() > 0);
}
