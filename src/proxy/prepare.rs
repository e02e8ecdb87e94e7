use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use ipnetwork::IpNetwork;
use std::net::SocketAddr;

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");

/// Headers that terminate at this hop (RFC 7230 §6.1) and must not be
/// forwarded.
fn hop_headers() -> [HeaderName; 9] {
    [
        header::CONNECTION,
        HeaderName::from_static("proxy-connection"),
        HeaderName::from_static("keep-alive"),
        header::PROXY_AUTHENTICATE,
        HeaderName::from_static("proxy-authorization"),
        header::TE,
        header::TRAILER,
        header::TRANSFER_ENCODING,
        header::UPGRADE,
    ]
}

/// Prepare the outbound header map once, before the try-loop, so retries do
/// not re-mutate. Returns the requested `Upgrade` token when the client
/// asked for a protocol switch. Idempotent: preparing twice yields the same
/// headers as preparing once.
pub fn prepare_headers(
    headers: &mut HeaderMap,
    peer: Option<SocketAddr>,
    original_host: &str,
    tls: bool,
    trusted_proxies: &[IpNetwork],
) -> Option<String> {
    // Without this, the HTTP client library may inject its own default.
    if !headers.contains_key(header::USER_AGENT) {
        headers.insert(header::USER_AGENT, HeaderValue::from_static(""));
    }

    // Record the upgrade request before the headers carrying it are gone.
    let upgrade_token = upgrade_token(headers);

    strip_hop_by_hop(headers, true);

    // Protocol switches still need the two hop-by-hop headers that drive
    // them, re-added deliberately rather than forwarded blindly.
    if let Some(token) = &upgrade_token {
        headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
        if let Ok(v) = HeaderValue::from_str(token) {
            headers.insert(header::UPGRADE, v);
        }
    }

    forward_headers(headers, peer, original_host, tls, trusted_proxies);

    upgrade_token
}

/// The request's `Upgrade` value, honored only when `Connection` lists the
/// upgrade option.
pub fn upgrade_token(headers: &HeaderMap) -> Option<String> {
    let connection_has_upgrade = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    if !connection_has_upgrade {
        return None;
    }
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

/// Remove hop-by-hop headers plus anything the `Connection` header names.
/// `preserve_te_trailers` keeps `TE: trailers` (the one TE value a proxy may
/// forward) on the request side.
fn strip_hop_by_hop(headers: &mut HeaderMap, preserve_te_trailers: bool) {
    let te_trailers = preserve_te_trailers
        && headers
            .get(header::TE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("trailers"));

    // Connection can name additional per-hop headers.
    let named: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    for name in named {
        if let Ok(h) = HeaderName::from_bytes(name.as_bytes()) {
            headers.remove(h);
        }
    }

    for h in &hop_headers() {
        headers.remove(h);
    }

    if te_trailers {
        headers.insert(header::TE, HeaderValue::from_static("trailers"));
    }
}

/// Strip hop-by-hop headers from an upstream response before it goes back
/// downstream.
pub fn strip_response_hop_headers(headers: &mut HeaderMap) {
    strip_hop_by_hop(headers, false);
}

/// `X-Forwarded-*` handling. Trusted peers get their inbound values
/// preserved with the peer appended to the `For` chain; everyone else gets
/// values derived from the immediate connection. Peers without an IP (unix
/// sockets) skip the trust check: nothing to vouch with, so inbound values
/// are dropped.
fn forward_headers(
    headers: &mut HeaderMap,
    peer: Option<SocketAddr>,
    original_host: &str,
    tls: bool,
    trusted_proxies: &[IpNetwork],
) {
    let peer_ip = peer.map(|p| p.ip());
    let trusted = peer_ip.is_some_and(|ip| trusted_proxies.iter().any(|net| net.contains(ip)));

    match (peer_ip, trusted) {
        (Some(ip), true) => {
            let ip_str = ip.to_string();
            let existing = headers
                .get(&X_FORWARDED_FOR)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            let last = existing.rsplit(',').next().map(str::trim).unwrap_or("");
            if last != ip_str {
                let combined = if existing.is_empty() {
                    ip_str
                } else {
                    format!("{}, {}", existing, ip_str)
                };
                if let Ok(v) = HeaderValue::from_str(&combined) {
                    headers.insert(X_FORWARDED_FOR, v);
                }
            }
        }
        (Some(ip), false) => {
            if let Ok(v) = HeaderValue::from_str(&ip.to_string()) {
                headers.insert(X_FORWARDED_FOR, v);
            }
        }
        (None, _) => {
            headers.remove(&X_FORWARDED_FOR);
        }
    }

    let proto = if tls { "https" } else { "http" };
    if !trusted || !headers.contains_key(&X_FORWARDED_PROTO) {
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));
    }

    if !trusted || !headers.contains_key(&X_FORWARDED_HOST) {
        if original_host.is_empty() {
            headers.remove(&X_FORWARDED_HOST);
        } else if let Ok(v) = HeaderValue::from_str(original_host) {
            headers.insert(X_FORWARDED_HOST, v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trusted(nets: &[&str]) -> Vec<IpNetwork> {
        nets.iter().map(|n| n.parse().unwrap()).collect()
    }

    fn peer(addr: &str) -> Option<SocketAddr> {
        Some(addr.parse().unwrap())
    }

    #[test]
    fn test_strips_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, "keep-alive".parse().unwrap());
        headers.insert("keep-alive", "timeout=5".parse().unwrap());
        headers.insert("proxy-connection", "keep-alive".parse().unwrap());
        headers.insert(header::TRANSFER_ENCODING, "chunked".parse().unwrap());
        headers.insert(header::TE, "gzip".parse().unwrap());
        headers.insert(header::TRAILER, "X-Checksum".parse().unwrap());
        headers.insert("proxy-authorization", "Basic xyz".parse().unwrap());
        headers.insert("x-app", "keep-me".parse().unwrap());

        prepare_headers(&mut headers, peer("1.2.3.4:80"), "example.com", false, &[]);

        assert!(!headers.contains_key(header::CONNECTION));
        assert!(!headers.contains_key("keep-alive"));
        assert!(!headers.contains_key("proxy-connection"));
        assert!(!headers.contains_key(header::TRANSFER_ENCODING));
        assert!(!headers.contains_key(header::TE));
        assert!(!headers.contains_key(header::TRAILER));
        assert!(!headers.contains_key("proxy-authorization"));
        assert_eq!(headers.get("x-app").unwrap(), "keep-me");
    }

    #[test]
    fn test_te_trailers_preserved() {
        let mut headers = HeaderMap::new();
        headers.insert(header::TE, "trailers".parse().unwrap());
        prepare_headers(&mut headers, peer("1.2.3.4:80"), "", false, &[]);
        assert_eq!(headers.get(header::TE).unwrap(), "trailers");
    }

    #[test]
    fn test_connection_named_headers_removed() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, "close, X-Internal-Token".parse().unwrap());
        headers.insert("x-internal-token", "secret".parse().unwrap());
        prepare_headers(&mut headers, peer("1.2.3.4:80"), "", false, &[]);
        assert!(!headers.contains_key("x-internal-token"));
    }

    #[test]
    fn test_upgrade_recorded_and_readded() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, "Upgrade".parse().unwrap());
        headers.insert(header::UPGRADE, "websocket".parse().unwrap());

        let token = prepare_headers(&mut headers, peer("1.2.3.4:80"), "", false, &[]);
        assert_eq!(token.as_deref(), Some("websocket"));
        assert_eq!(headers.get(header::CONNECTION).unwrap(), "Upgrade");
        assert_eq!(headers.get(header::UPGRADE).unwrap(), "websocket");
    }

    #[test]
    fn test_upgrade_without_connection_header_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(header::UPGRADE, "websocket".parse().unwrap());
        let token = prepare_headers(&mut headers, peer("1.2.3.4:80"), "", false, &[]);
        assert!(token.is_none());
        assert!(!headers.contains_key(header::UPGRADE));
    }

    #[test]
    fn test_missing_user_agent_blanked() {
        let mut headers = HeaderMap::new();
        prepare_headers(&mut headers, peer("1.2.3.4:80"), "", false, &[]);
        assert_eq!(headers.get(header::USER_AGENT).unwrap(), "");

        let mut headers = HeaderMap::new();
        headers.insert(header::USER_AGENT, "curl/8".parse().unwrap());
        prepare_headers(&mut headers, peer("1.2.3.4:80"), "", false, &[]);
        assert_eq!(headers.get(header::USER_AGENT).unwrap(), "curl/8");
    }

    #[test]
    fn test_untrusted_peer_replaces_forwarded() {
        let mut headers = HeaderMap::new();
        headers.insert(X_FORWARDED_FOR, "203.0.113.9".parse().unwrap());
        headers.insert(X_FORWARDED_PROTO, "https".parse().unwrap());
        headers.insert(X_FORWARDED_HOST, "spoofed.example".parse().unwrap());

        prepare_headers(
            &mut headers,
            peer("198.51.100.7:4444"),
            "real.example",
            false,
            &[],
        );

        assert_eq!(headers.get(&X_FORWARDED_FOR).unwrap(), "198.51.100.7");
        assert_eq!(headers.get(&X_FORWARDED_PROTO).unwrap(), "http");
        assert_eq!(headers.get(&X_FORWARDED_HOST).unwrap(), "real.example");
    }

    #[test]
    fn test_trusted_peer_appends_forwarded() {
        let nets = trusted(&["10.0.0.0/8"]);
        let mut headers = HeaderMap::new();
        headers.insert(X_FORWARDED_FOR, "203.0.113.9".parse().unwrap());
        headers.insert(X_FORWARDED_PROTO, "https".parse().unwrap());
        headers.insert(X_FORWARDED_HOST, "public.example".parse().unwrap());

        prepare_headers(&mut headers, peer("10.1.2.3:9999"), "internal", false, &nets);

        assert_eq!(
            headers.get(&X_FORWARDED_FOR).unwrap(),
            "203.0.113.9, 10.1.2.3"
        );
        // Inbound values from a trusted hop are preserved.
        assert_eq!(headers.get(&X_FORWARDED_PROTO).unwrap(), "https");
        assert_eq!(headers.get(&X_FORWARDED_HOST).unwrap(), "public.example");
    }

    #[test]
    fn test_preparation_is_idempotent() {
        let nets = trusted(&["10.0.0.0/8"]);
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, "Upgrade".parse().unwrap());
        headers.insert(header::UPGRADE, "websocket".parse().unwrap());
        headers.insert(X_FORWARDED_FOR, "203.0.113.9".parse().unwrap());
        headers.insert(header::TE, "trailers".parse().unwrap());

        let mut once = headers.clone();
        prepare_headers(&mut once, peer("10.1.2.3:9999"), "h.example", true, &nets);

        let mut twice = once.clone();
        prepare_headers(&mut twice, peer("10.1.2.3:9999"), "h.example", true, &nets);

        assert_eq!(once, twice);
    }

    #[test]
    fn test_unix_peer_skips_trust_check_without_error() {
        let nets = trusted(&["10.0.0.0/8"]);
        let mut headers = HeaderMap::new();
        headers.insert(X_FORWARDED_FOR, "203.0.113.9".parse().unwrap());

        prepare_headers(&mut headers, None, "h.example", false, &nets);

        // No IP to vouch with: inbound chain is dropped, proto/host are set
        // from the immediate connection.
        assert!(!headers.contains_key(&X_FORWARDED_FOR));
        assert_eq!(headers.get(&X_FORWARDED_PROTO).unwrap(), "http");
        assert_eq!(headers.get(&X_FORWARDED_HOST).unwrap(), "h.example");
    }

    #[test]
    fn test_response_strip_keeps_no_te() {
        let mut headers = HeaderMap::new();
        headers.insert(header::TE, "trailers".parse().unwrap());
        headers.insert(header::CONNECTION, "keep-alive".parse().unwrap());
        strip_response_hop_headers(&mut headers);
        assert!(!headers.contains_key(header::TE));
        assert!(!headers.contains_key(header::CONNECTION));
    }
}
