use crate::upstream::policy::{Policy, Selection, SelectionInput};
use crate::upstream::pool::{Upstream, UpstreamPool};

const FNV_OFFSET: u32 = 2_166_136_261;
const FNV_PRIME: u32 = 16_777_619;

/// 32-bit FNV-1a.
pub fn fnv1a32(data: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET;
    for &b in data {
        hash ^= b as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Map a key onto the pool: start at `hash % n`, then probe with a growing
/// stride (`index += i` per step, modulo n). The stride walk can revisit
/// slots for pool sizes that are not powers of two, so any slots it missed
/// are swept in order afterwards — the whole pool gets visited before
/// giving up.
pub fn select_by_key(pool: &UpstreamPool, key: &[u8]) -> Option<usize> {
    let n = pool.len();
    if n == 0 {
        return None;
    }
    let mut visited = vec![false; n];
    let mut index = fnv1a32(key) as usize % n;
    for i in 1..=n {
        if !visited[index] {
            visited[index] = true;
            if pool.get(index).is_some_and(|u| u.available()) {
                return Some(index);
            }
        }
        index = (index + i) % n;
    }
    for (i, up) in pool.iter().enumerate() {
        if !visited[i] && up.available() {
            return Some(i);
        }
    }
    None
}

/// Key: the peer IP, port stripped. `None` when the peer has no IP (unix
/// socket) — the caller falls back to random.
pub fn select_by_ip(pool: &UpstreamPool, input: &SelectionInput<'_>) -> Option<usize> {
    let ip = input.remote_addr?.ip().to_string();
    select_by_key(pool, ip.as_bytes())
}

/// Key: the request-URI as seen on the wire.
pub fn select_by_uri(pool: &UpstreamPool, input: &SelectionInput<'_>) -> Option<usize> {
    let key = input
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| input.uri.path());
    select_by_key(pool, key.as_bytes())
}

/// Key: the first value of the named query parameter. `None` when absent.
pub fn select_by_query(
    pool: &UpstreamPool,
    input: &SelectionInput<'_>,
    param: &str,
) -> Option<usize> {
    let query = input.uri.query()?;
    let value = query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        (k == param).then_some(v)
    })?;
    if value.is_empty() {
        return None;
    }
    select_by_key(pool, value.as_bytes())
}

/// Key: the named header's value; `Host` maps to the request host. `None`
/// when absent or empty.
pub fn select_by_header(
    pool: &UpstreamPool,
    input: &SelectionInput<'_>,
    field: &str,
) -> Option<usize> {
    let value = if field.eq_ignore_ascii_case("host") {
        input
            .headers
            .get(http::header::HOST)
            .and_then(|v| v.to_str().ok())
            .or_else(|| input.uri.host())
            .unwrap_or("")
            .to_string()
    } else {
        input
            .headers
            .get(field)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string()
    };
    if value.is_empty() {
        return None;
    }
    select_by_key(pool, value.as_bytes())
}

/// Affinity cookie carried by the client. Returning clients are pinned to
/// the upstream whose hash matches their cookie; everyone else goes through
/// the fallback policy and gets a (fresh or overwritten) cookie. The value
/// is plain FNV-1a hex: affinity only, never trust.
pub fn select_by_cookie(
    pool: &UpstreamPool,
    input: &SelectionInput<'_>,
    name: &str,
    fallback: &Policy,
) -> Option<Selection> {
    if let Some(wanted) = cookie_value(input.headers, name) {
        if let Some(index) = pool.iter().position(|u| upstream_cookie(u) == wanted) {
            if pool.get(index).is_some_and(|u| u.available()) {
                return Some(Selection {
                    index,
                    set_cookie: None,
                });
            }
        }
    }

    let fallen = fallback.select(pool, input)?;
    let upstream = pool.get(fallen.index)?;
    Some(Selection {
        index: fallen.index,
        set_cookie: Some(build_cookie(name, &upstream_cookie(upstream), input.tls)),
    })
}

fn upstream_cookie(upstream: &Upstream) -> String {
    format!("{:08x}", fnv1a32(upstream.addr().as_bytes()))
}

fn build_cookie(name: &str, value: &str, tls: bool) -> String {
    if tls {
        // Cross-site WebSocket/APIs need SameSite=None, which requires
        // Secure.
        format!("{}={}; Secure; SameSite=None", name, value)
    } else {
        format!("{}={}", name, value)
    }
}

fn cookie_value(headers: &http::HeaderMap, name: &str) -> Option<String> {
    for header in headers.get_all(http::header::COOKIE) {
        let raw = header.to_str().ok()?;
        for pair in raw.split(';') {
            let (k, v) = pair.trim().split_once('=')?;
            if k == name {
                return Some(v.to_string());
            }
        }
    }
    None
}
