pub mod hash;

use crate::config::SelectionConfig;
use crate::error::ProxyError;
use crate::upstream::pool::UpstreamPool;
use rand::Rng;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Request attributes a policy may key on. Policies read, never mutate.
pub struct SelectionInput<'a> {
    /// TCP peer of the downstream connection; `None` for unix-socket peers.
    pub remote_addr: Option<SocketAddr>,
    pub uri: &'a http::Uri,
    pub headers: &'a http::HeaderMap,
    /// Whether the downstream connection arrived over TLS (cookie flags).
    pub tls: bool,
}

/// Outcome of a selection: the pool index plus, for cookie affinity, a
/// `Set-Cookie` value the forwarder must attach to the response.
#[derive(Debug, PartialEq, Eq)]
pub struct Selection {
    pub index: usize,
    pub set_cookie: Option<String>,
}

impl Selection {
    fn plain(index: usize) -> Self {
        Self {
            index,
            set_cookie: None,
        }
    }
}

/// Enum-based selection policies — no trait objects, the variant is resolved
/// once at provisioning time.
pub enum Policy {
    Random,
    RandomChoose { k: usize },
    LeastRequests,
    RoundRobin { counter: AtomicU64 },
    WeightedRoundRobin { counter: AtomicU64 },
    FirstAvailable,
    IpHash,
    UriHash,
    QueryHash { key: String },
    HeaderHash { field: String },
    CookieHash { name: String, fallback: Box<Policy> },
}

impl Policy {
    pub fn from_config(cfg: &SelectionConfig) -> Result<Self, ProxyError> {
        Self::from_name(&cfg.policy, cfg)
    }

    fn from_name(name: &str, cfg: &SelectionConfig) -> Result<Self, ProxyError> {
        Ok(match name {
            "random" => Policy::Random,
            "random_choose" => Policy::RandomChoose {
                k: cfg.choose.max(2),
            },
            "least_requests" => Policy::LeastRequests,
            "round_robin" => Policy::RoundRobin {
                counter: AtomicU64::new(0),
            },
            "weighted_round_robin" => Policy::WeightedRoundRobin {
                counter: AtomicU64::new(0),
            },
            "first_available" => Policy::FirstAvailable,
            "ip_hash" => Policy::IpHash,
            "uri_hash" => Policy::UriHash,
            "query_hash" => Policy::QueryHash {
                key: cfg.field.clone(),
            },
            "header_hash" => Policy::HeaderHash {
                field: cfg.field.clone(),
            },
            "cookie_hash" => {
                if cfg.fallback == "cookie_hash" {
                    return Err(ProxyError::Config(
                        "cookie_hash cannot fall back to itself".to_string(),
                    ));
                }
                Policy::CookieHash {
                    name: if cfg.field.is_empty() {
                        "lb".to_string()
                    } else {
                        cfg.field.clone()
                    },
                    fallback: Box::new(Self::from_name(&cfg.fallback, cfg)?),
                }
            }
            other => {
                return Err(ProxyError::Config(format!(
                    "unknown selection policy {:?}",
                    other
                )))
            }
        })
    }

    /// Pick an available upstream, or `None` when nothing qualifies. Only
    /// upstreams for which `available()` holds at call time are returned;
    /// request counting is the forwarder's job.
    pub fn select(&self, pool: &UpstreamPool, input: &SelectionInput<'_>) -> Option<Selection> {
        if pool.is_empty() {
            return None;
        }
        match self {
            Policy::Random => select_random(pool).map(Selection::plain),
            Policy::RandomChoose { k } => select_random_choose(pool, *k).map(Selection::plain),
            Policy::LeastRequests => select_least_requests(pool).map(Selection::plain),
            Policy::RoundRobin { counter } => select_round_robin(pool, counter).map(Selection::plain),
            Policy::WeightedRoundRobin { counter } => {
                select_weighted_round_robin(pool, counter).map(Selection::plain)
            }
            Policy::FirstAvailable => pool
                .iter()
                .position(|u| u.available())
                .map(Selection::plain),
            Policy::IpHash => hash::select_by_ip(pool, input)
                .map(Selection::plain)
                .or_else(|| select_random(pool).map(Selection::plain)),
            Policy::UriHash => hash::select_by_uri(pool, input).map(Selection::plain),
            Policy::QueryHash { key } => hash::select_by_query(pool, input, key)
                .map(Selection::plain)
                .or_else(|| select_random(pool).map(Selection::plain)),
            Policy::HeaderHash { field } => hash::select_by_header(pool, input, field)
                .map(Selection::plain)
                .or_else(|| select_random(pool).map(Selection::plain)),
            Policy::CookieHash { name, fallback } => {
                hash::select_by_cookie(pool, input, name, fallback)
            }
        }
    }
}

/// Reservoir-sample one index across the available subset.
fn select_random(pool: &UpstreamPool) -> Option<usize> {
    let mut rng = rand::thread_rng();
    let mut chosen = None;
    let mut seen = 0usize;
    for (i, up) in pool.iter().enumerate() {
        if !up.available() {
            continue;
        }
        seen += 1;
        if rng.gen_range(0..seen) == 0 {
            chosen = Some(i);
        }
    }
    chosen
}

/// Power of k choices: uniform sample of k available upstreams, then the one
/// with the fewest in-flight requests (ties broken by sample order, which is
/// itself random).
fn select_random_choose(pool: &UpstreamPool, k: usize) -> Option<usize> {
    let mut rng = rand::thread_rng();
    let mut sample: Vec<usize> = Vec::with_capacity(k);
    let mut seen = 0usize;
    for (i, up) in pool.iter().enumerate() {
        if !up.available() {
            continue;
        }
        seen += 1;
        if sample.len() < k {
            sample.push(i);
        } else {
            let j = rng.gen_range(0..seen);
            if j < k {
                sample[j] = i;
            }
        }
    }

    sample
        .into_iter()
        .min_by_key(|&i| pool.get(i).map(|u| u.num_requests()).unwrap_or(i64::MAX))
}

/// Full scan; uniform pick among the upstreams sharing the minimum in-flight
/// count.
fn select_least_requests(pool: &UpstreamPool) -> Option<usize> {
    let mut best: Vec<usize> = Vec::new();
    let mut min = i64::MAX;
    for (i, up) in pool.iter().enumerate() {
        if !up.available() {
            continue;
        }
        let n = up.num_requests();
        if n < min {
            min = n;
            best.clear();
            best.push(i);
        } else if n == min {
            best.push(i);
        }
    }
    match best.len() {
        0 => None,
        1 => Some(best[0]),
        n => Some(best[rand::thread_rng().gen_range(0..n)]),
    }
}

/// The counter advances on every probe, so skipped (unavailable) entries are
/// consumed and the rotation resumes where it left off.
fn select_round_robin(pool: &UpstreamPool, counter: &AtomicU64) -> Option<usize> {
    let n = pool.len() as u64;
    for _ in 0..n {
        let c = counter.fetch_add(1, Ordering::Relaxed);
        let idx = (c % n) as usize;
        if pool.get(idx).is_some_and(|u| u.available()) {
            return Some(idx);
        }
    }
    None
}

/// Round-robin over the expanded virtual sequence whose length is the sum of
/// weights; a weight-3 upstream owns three consecutive virtual slots.
fn select_weighted_round_robin(pool: &UpstreamPool, counter: &AtomicU64) -> Option<usize> {
    let total = pool.total_weight();
    if total == 0 {
        return None;
    }
    for _ in 0..total {
        let c = counter.fetch_add(1, Ordering::Relaxed);
        let mut target = c % total;
        for (i, up) in pool.iter().enumerate() {
            let w = up.weight().max(1) as u64;
            if target < w {
                if up.available() {
                    return Some(i);
                }
                break;
            }
            target -= w;
        }
    }
    None
}
