use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::time::Duration;

/// (De)serialize `Duration` as a humantime string ("250ms", "30s", "2m").
pub mod duration_str {
    use super::*;
    use serde::de::Error as _;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*d).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        humantime::parse_duration(&raw).map_err(D::Error::custom)
    }
}

/// Top-level proxy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_listen")]
    pub listen: String,

    #[serde(default = "default_admin_listen")]
    pub admin_listen: String,

    pub proxy: HandlerConfig,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_admin_listen() -> String {
    "0.0.0.0:9091".to_string()
}

/// One reverse-proxy handler: the upstream pool plus everything that governs
/// how requests are forwarded to it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HandlerConfig {
    pub upstreams: Vec<UpstreamConfig>,

    #[serde(default)]
    pub selection: SelectionConfig,

    /// Total wall-clock budget for the try-loop. Zero means a single attempt.
    #[serde(default = "default_try_duration", with = "duration_str")]
    pub try_duration: Duration,

    /// Pause between attempts.
    #[serde(default = "default_try_interval", with = "duration_str")]
    pub try_interval: Duration,

    /// Response statuses that trigger a retry in addition to transport
    /// errors. Empty by default: status >= 300 flows through to the client.
    #[serde(default)]
    pub retry_on_statuses: StatusCodeSet,

    #[serde(default)]
    pub flush_interval: FlushInterval,

    /// Grace period before hijacked streams are closed on shutdown.
    #[serde(default = "default_zero_duration", with = "duration_str")]
    pub stream_close_delay: Duration,

    /// Body of the 502 answer when selection never produced an upstream.
    /// Empty means the last error's message is used.
    #[serde(default)]
    pub fail_message: String,

    #[serde(default)]
    pub health_checks: HealthChecksConfig,

    #[serde(default)]
    pub circuit_breaker: Option<CircuitBreakerConfig>,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub headers: HeaderOpsConfig,

    /// CIDRs of downstream peers whose `X-Forwarded-*` headers are trusted.
    #[serde(default)]
    pub trusted_proxies: Vec<String>,
}

fn default_try_duration() -> Duration {
    Duration::ZERO
}

fn default_try_interval() -> Duration {
    Duration::from_millis(250)
}

fn default_zero_duration() -> Duration {
    Duration::ZERO
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Backend address: "host:port" or "unix/<path>".
    pub dial: String,

    /// Per-upstream active-request cap; 0 = unlimited.
    #[serde(default)]
    pub max_requests: usize,

    /// Only meaningful for weighted selection.
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

/// Selection policy. `policy` names the algorithm; `field` carries the
/// header/query/cookie key for the hashing policies; `choose` is the k of
/// random-choose; `fallback` is the secondary policy for cookie affinity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionConfig {
    #[serde(default = "default_policy")]
    pub policy: String,

    #[serde(default)]
    pub field: String,

    #[serde(default = "default_choose")]
    pub choose: usize,

    #[serde(default = "default_policy")]
    pub fallback: String,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            policy: default_policy(),
            field: String::new(),
            choose: default_choose(),
            fallback: default_policy(),
        }
    }
}

fn default_policy() -> String {
    "random".to_string()
}

fn default_choose() -> usize {
    2
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthChecksConfig {
    #[serde(default)]
    pub active: Option<ActiveHealthConfig>,

    #[serde(default)]
    pub passive: Option<PassiveHealthConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveHealthConfig {
    /// Probe path (plus optional query) appended to the upstream address.
    #[serde(default = "default_hc_path")]
    pub path: String,

    /// Probe port override; defaults to the upstream's own port.
    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default = "default_hc_interval", with = "duration_str")]
    pub interval: Duration,

    #[serde(default = "default_hc_timeout", with = "duration_str")]
    pub timeout: Duration,

    /// Host header override for probes.
    #[serde(default)]
    pub host: Option<String>,

    /// Extra headers sent with each probe.
    #[serde(default)]
    pub headers: Vec<HeaderOpConfig>,

    #[serde(default = "default_expect_status")]
    pub expect_status: StatusCodeSet,

    /// Regex the (bounded) response body must match.
    #[serde(default)]
    pub expect_body: Option<String>,

    /// Per-header expectations; exact match unless `regex` is set.
    #[serde(default)]
    pub expect_headers: Vec<HeaderExpectation>,

    /// Cap on probe-body bytes read for `expect_body`.
    #[serde(default = "default_hc_max_size")]
    pub max_size: usize,

    /// Consecutive passes needed to flip an unhealthy upstream back.
    #[serde(default = "default_hc_threshold")]
    pub pass_threshold: u32,

    /// Consecutive failures needed to mark an upstream unhealthy.
    #[serde(default = "default_hc_threshold")]
    pub fail_threshold: u32,

    /// Probe fan-out cap per tick.
    #[serde(default = "default_hc_concurrency")]
    pub concurrency: usize,
}

impl Default for ActiveHealthConfig {
    fn default() -> Self {
        Self {
            path: default_hc_path(),
            port: None,
            interval: default_hc_interval(),
            timeout: default_hc_timeout(),
            host: None,
            headers: Vec::new(),
            expect_status: default_expect_status(),
            expect_body: None,
            expect_headers: Vec::new(),
            max_size: default_hc_max_size(),
            pass_threshold: default_hc_threshold(),
            fail_threshold: default_hc_threshold(),
            concurrency: default_hc_concurrency(),
        }
    }
}

fn default_hc_path() -> String {
    "/".to_string()
}

fn default_hc_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_hc_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_expect_status() -> StatusCodeSet {
    StatusCodeSet(vec![StatusRange {
        start: 200,
        end: 399,
    }])
}

fn default_hc_max_size() -> usize {
    4 * 1024
}

fn default_hc_threshold() -> u32 {
    1
}

fn default_hc_concurrency() -> usize {
    16
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderExpectation {
    pub name: String,

    #[serde(default)]
    pub value: String,

    #[serde(default)]
    pub regex: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassiveHealthConfig {
    /// Failure count at which the upstream stops being selected.
    #[serde(default = "default_max_fails")]
    pub max_fails: i64,

    /// How long each counted failure lingers. Zero means failures never
    /// decay.
    #[serde(default = "default_zero_duration", with = "duration_str")]
    pub fail_duration: Duration,

    /// Round-trips at or above this latency count as failures. Zero
    /// disables the latency trigger.
    #[serde(default = "default_zero_duration", with = "duration_str")]
    pub unhealthy_latency: Duration,

    /// Response statuses counted as failures.
    #[serde(default)]
    pub unhealthy_statuses: StatusCodeSet,

    /// Default `max_requests` for upstreams that did not set their own.
    #[serde(default)]
    pub unhealthy_request_count: usize,
}

impl Default for PassiveHealthConfig {
    fn default() -> Self {
        Self {
            max_fails: default_max_fails(),
            fail_duration: Duration::ZERO,
            unhealthy_latency: Duration::ZERO,
            unhealthy_statuses: StatusCodeSet::default(),
            unhealthy_request_count: 0,
        }
    }
}

fn default_max_fails() -> i64 {
    1
}

/// Rolling-window breaker: `factor` picks the tripping metric.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// "latency", "error_ratio", or "status_ratio".
    #[serde(default = "default_cb_factor")]
    pub factor: String,

    /// Meaning depends on `factor`: milliseconds for latency, a 0..1 ratio
    /// otherwise.
    #[serde(default = "default_cb_threshold")]
    pub threshold: f64,

    /// Latency quantile inspected when factor = "latency".
    #[serde(default = "default_cb_percentile")]
    pub percentile: f64,

    /// How long the breaker stays open once tripped.
    #[serde(default = "default_cb_trip_time", with = "duration_str")]
    pub trip_time: Duration,

    /// Width of the rolling sample window.
    #[serde(default = "default_cb_window", with = "duration_str")]
    pub window: Duration,
}

fn default_cb_factor() -> String {
    "latency".to_string()
}

fn default_cb_threshold() -> f64 {
    500.0
}

fn default_cb_percentile() -> f64 {
    0.95
}

fn default_cb_trip_time() -> Duration {
    Duration::from_secs(5)
}

fn default_cb_window() -> Duration {
    Duration::from_secs(10)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Enabled protocol versions: subset of "1.1", "2", "h2c", "3".
    #[serde(default = "default_versions")]
    pub versions: Vec<String>,

    #[serde(default = "default_dial_timeout", with = "duration_str")]
    pub dial_timeout: Duration,

    #[serde(default)]
    pub keep_alive: KeepAliveConfig,

    /// Per-connection read deadline on the direct-dial path. Zero disables.
    #[serde(default = "default_zero_duration", with = "duration_str")]
    pub read_timeout: Duration,

    /// Per-connection write deadline on the direct-dial path. Zero disables.
    #[serde(default = "default_zero_duration", with = "duration_str")]
    pub write_timeout: Duration,

    /// "" (disabled), "v1", or "v2". Implies fresh connections per request.
    #[serde(default)]
    pub proxy_protocol: String,

    /// Local address to bind outbound sockets to.
    #[serde(default)]
    pub local_address: Option<String>,

    #[serde(default)]
    pub tls: Option<TlsClientConfig>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            versions: default_versions(),
            dial_timeout: default_dial_timeout(),
            keep_alive: KeepAliveConfig::default(),
            read_timeout: Duration::ZERO,
            write_timeout: Duration::ZERO,
            proxy_protocol: String::new(),
            local_address: None,
            tls: None,
        }
    }
}

fn default_versions() -> Vec<String> {
    vec!["1.1".to_string(), "2".to_string()]
}

fn default_dial_timeout() -> Duration {
    Duration::from_secs(10)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepAliveConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_probe_interval", with = "duration_str")]
    pub probe_interval: Duration,

    #[serde(default = "default_idle_timeout", with = "duration_str")]
    pub idle_timeout: Duration,

    #[serde(default = "default_max_idle_per_host")]
    pub max_idle_conns_per_host: usize,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            probe_interval: default_probe_interval(),
            idle_timeout: default_idle_timeout(),
            max_idle_conns_per_host: default_max_idle_per_host(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_probe_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_max_idle_per_host() -> usize {
    32
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsClientConfig {
    /// PEM files whose certificates are added to the root pool.
    #[serde(default)]
    pub root_ca_pem_files: Vec<String>,

    /// Base64 DER certificates added to the root pool.
    #[serde(default)]
    pub root_ca_certs: Vec<String>,

    /// Client certificate PEM file (with `client_certificate_key_file`).
    #[serde(default)]
    pub client_certificate_file: Option<String>,

    #[serde(default)]
    pub client_certificate_key_file: Option<String>,

    /// SNI override. Forces the direct-dial TLS path.
    #[serde(default)]
    pub server_name: Option<String>,

    #[serde(default)]
    pub insecure_skip_verify: bool,

    /// Upstream ports dialed without TLS even though TLS is enabled.
    #[serde(default)]
    pub except_ports: Vec<u16>,

    #[serde(default = "default_handshake_timeout", with = "duration_str")]
    pub handshake_timeout: Duration,
}

fn default_handshake_timeout() -> Duration {
    Duration::from_secs(10)
}

/// Static header rewrite op applied to forwarded requests or responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderOpConfig {
    pub name: String,

    #[serde(default)]
    pub value: String,

    /// "set" (default), "add", "remove".
    #[serde(default = "default_header_action")]
    pub action: String,
}

fn default_header_action() -> String {
    "set".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeaderOpsConfig {
    #[serde(default)]
    pub request: Vec<HeaderOpConfig>,

    #[serde(default)]
    pub response: Vec<HeaderOpConfig>,
}

/// Set of HTTP status codes given as exact codes (`503`), class digits
/// (`5` meaning 500-599), or ranges (`"500-504"`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusCodeSet(pub Vec<StatusRange>);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusRange {
    pub start: u16,
    pub end: u16,
}

impl StatusCodeSet {
    pub fn contains(&self, status: u16) -> bool {
        self.0
            .iter()
            .any(|r| status >= r.start && status <= r.end)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Deserialize, Serialize)]
#[serde(untagged)]
enum StatusEntry {
    Code(u16),
    Range(String),
}

impl<'de> Deserialize<'de> for StatusCodeSet {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let entries = Vec::<StatusEntry>::deserialize(d)?;
        let mut ranges = Vec::with_capacity(entries.len());
        for entry in entries {
            match entry {
                StatusEntry::Code(c) if (1..=9).contains(&c) => ranges.push(StatusRange {
                    start: c * 100,
                    end: c * 100 + 99,
                }),
                StatusEntry::Code(c) => ranges.push(StatusRange { start: c, end: c }),
                StatusEntry::Range(s) => {
                    let (a, b) = s
                        .split_once('-')
                        .ok_or_else(|| D::Error::custom(format!("bad status range {:?}", s)))?;
                    let start: u16 = a.trim().parse().map_err(D::Error::custom)?;
                    let end: u16 = b.trim().parse().map_err(D::Error::custom)?;
                    if end < start {
                        return Err(D::Error::custom(format!("bad status range {:?}", s)));
                    }
                    ranges.push(StatusRange { start, end });
                }
            }
        }
        Ok(StatusCodeSet(ranges))
    }
}

impl Serialize for StatusCodeSet {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        let entries: Vec<StatusEntry> = self
            .0
            .iter()
            .map(|r| {
                if r.start == r.end {
                    StatusEntry::Code(r.start)
                } else {
                    StatusEntry::Range(format!("{}-{}", r.start, r.end))
                }
            })
            .collect();
        entries.serialize(s)
    }
}

/// Response flush cadence: `Off` buffers until the chunk threshold, `Every`
/// flushes at most that long after a write, `Immediate` never buffers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FlushInterval {
    #[default]
    Off,
    Immediate,
    Every(Duration),
}

impl<'de> Deserialize<'de> for FlushInterval {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        let trimmed = raw.trim();
        if trimmed == "-1" {
            return Ok(FlushInterval::Immediate);
        }
        let dur = humantime::parse_duration(trimmed).map_err(D::Error::custom)?;
        if dur.is_zero() {
            Ok(FlushInterval::Off)
        } else {
            Ok(FlushInterval::Every(dur))
        }
    }
}

impl Serialize for FlushInterval {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        match self {
            FlushInterval::Off => s.serialize_str("0s"),
            FlushInterval::Immediate => s.serialize_str("-1"),
            FlushInterval::Every(d) => {
                s.serialize_str(&humantime::format_duration(*d).to_string())
            }
        }
    }
}
