use crate::config::{ActiveHealthConfig, HandlerConfig, HeaderOpConfig, StatusCodeSet};
use crate::error::ProxyError;
use crate::proxy::streaming::{flush_policy, relay_body};
use crate::proxy::upgrade::{self, StreamRegistry};
use crate::proxy::{empty_body, full_body, prepare, BoxBody, BoxError};
use crate::transport::Transport;
use crate::upstream::{
    ActiveHealthChecker, CircuitBreaker, DialInfo, PassiveHealth, Policy, SelectionInput,
    Upstream, UpstreamPool,
};
use bytes::Bytes;
use http::header::{self, HeaderName, HeaderValue};
use http::StatusCode;
use http_body_util::BodyExt;
use hyper::body::{Body, Frame};
use hyper::{Request, Response};
use ipnetwork::IpNetwork;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Connection-level facts the HTTP layer cannot see, supplied by the server
/// accept loop.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestMeta {
    /// Downstream TCP peer; `None` for unix-socket listeners.
    pub peer: Option<SocketAddr>,
    /// Local address of the accepted connection (PROXY protocol preamble).
    pub local: Option<SocketAddr>,
    /// Whether the downstream connection arrived over TLS.
    pub tls: bool,
}

#[derive(Clone, Copy, PartialEq)]
enum HeaderAction {
    Set,
    Add,
    Remove,
}

struct HeaderOp {
    name: HeaderName,
    value: HeaderValue,
    action: HeaderAction,
}

/// One provisioned reverse-proxy handler: pool, policy, transport, health
/// machinery, and the try-loop tying them together. Immutable once built;
/// config reloads construct a fresh handler and swap it in.
pub struct Handler {
    pool: Arc<UpstreamPool>,
    policy: Policy,
    transport: Transport,
    passive: Option<PassiveHealth>,
    active_cfg: Option<ActiveHealthConfig>,
    try_duration: Duration,
    try_interval: Duration,
    retry_on_statuses: StatusCodeSet,
    flush_interval: crate::config::FlushInterval,
    stream_close_delay: Duration,
    fail_message: String,
    request_ops: Vec<HeaderOp>,
    response_ops: Vec<HeaderOp>,
    trusted_proxies: Vec<IpNetwork>,
    streams: Arc<StreamRegistry>,
}

impl Handler {
    pub fn new(cfg: &HandlerConfig) -> Result<Self, ProxyError> {
        let passive_cfg = cfg.health_checks.passive.as_ref();

        let mut upstreams = Vec::with_capacity(cfg.upstreams.len());
        for up_cfg in &cfg.upstreams {
            let breaker = cfg
                .circuit_breaker
                .as_ref()
                .map(|cb| Arc::new(CircuitBreaker::new(cb, &up_cfg.dial)));
            upstreams.push(Upstream::from_config(up_cfg, passive_cfg, breaker)?);
        }
        let pool = Arc::new(UpstreamPool::new(upstreams));

        let policy = Policy::from_config(&cfg.selection)?;
        let transport = Transport::new(cfg.transport.clone())?;

        let trusted_proxies = cfg
            .trusted_proxies
            .iter()
            .map(|s| {
                s.parse::<IpNetwork>()
                    .map_err(|e| ProxyError::Config(format!("bad trusted proxy {:?}: {}", s, e)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            pool,
            policy,
            transport,
            passive: passive_cfg.map(|p| PassiveHealth::new(p.clone())),
            active_cfg: cfg.health_checks.active.clone(),
            try_duration: cfg.try_duration,
            try_interval: cfg.try_interval,
            retry_on_statuses: cfg.retry_on_statuses.clone(),
            flush_interval: cfg.flush_interval,
            stream_close_delay: cfg.stream_close_delay,
            fail_message: cfg.fail_message.clone(),
            request_ops: compile_ops(&cfg.headers.request)?,
            response_ops: compile_ops(&cfg.headers.response)?,
            trusted_proxies,
            streams: StreamRegistry::new(),
        })
    }

    pub fn pool(&self) -> &Arc<UpstreamPool> {
        &self.pool
    }

    pub fn streams(&self) -> &Arc<StreamRegistry> {
        &self.streams
    }

    pub fn stream_close_delay(&self) -> Duration {
        self.stream_close_delay
    }

    /// Start the active health worker (when configured) and the health
    /// gauge reporter. Both stop when `shutdown` is notified.
    pub fn spawn_workers(&self, shutdown: &Arc<Notify>) -> Result<(), ProxyError> {
        if let Some(active) = &self.active_cfg {
            let checker = Arc::new(ActiveHealthChecker::new(
                self.pool.clone(),
                active.clone(),
                self.transport.tls_enabled(),
                self.transport.tls_insecure(),
            )?);
            tokio::spawn(async move {
                checker.probe_round().await;
            });
        }
        crate::upstream::spawn_health_gauge_reporter(self.pool.clone(), shutdown.clone());
        Ok(())
    }

    /// Forward one request. Infallible at the type level: every failure
    /// becomes an HTTP error response.
    pub async fn handle<B>(&self, req: Request<B>, meta: RequestMeta) -> Response<BoxBody>
    where
        B: Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<BoxError>,
    {
        let start = Instant::now();
        metrics::gauge!("proxy_http_requests_in_flight").increment(1.0);
        let resp = self.forward(req, meta, start).await;
        metrics::gauge!("proxy_http_requests_in_flight").decrement(1.0);

        let mut buf = itoa::Buffer::new();
        metrics::counter!(
            "proxy_http_requests_total",
            "status_code" => buf.format(resp.status().as_u16()).to_owned(),
        )
        .increment(1);
        metrics::histogram!("proxy_http_request_duration_seconds")
            .record(start.elapsed().as_secs_f64());

        resp
    }

    async fn forward<B>(
        &self,
        req: Request<B>,
        meta: RequestMeta,
        start: Instant,
    ) -> Response<BoxBody>
    where
        B: Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<BoxError>,
    {
        let (mut parts, body) = req.into_parts();
        let method = parts.method.clone();
        let uri = parts.uri.clone();
        let version = parts.version;

        // HTTP/2 requests carry the host in the URI authority only; the
        // outbound HTTP/1.1 leg needs a Host header.
        if !parts.headers.contains_key(header::HOST) {
            if let Some(authority) = uri.authority() {
                if let Ok(v) = HeaderValue::from_str(authority.as_str()) {
                    parts.headers.insert(header::HOST, v);
                }
            }
        }
        let original_host = parts
            .headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let accept_encoding = parts
            .headers
            .get(header::ACCEPT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_owned());

        let downstream_upgrade = parts.extensions.remove::<hyper::upgrade::OnUpgrade>();

        // Prepared exactly once so retries do not re-mutate.
        let mut headers = parts.headers;
        let upgrade_requested = prepare::prepare_headers(
            &mut headers,
            meta.peer,
            &original_host,
            meta.tls,
            &self.trusted_proxies,
        );
        apply_ops(&self.request_ops, &mut headers);

        // Body strategy: empty and sized bodies are replayable across
        // attempts; chunked uploads stream through once.
        let content_length = headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let bodyless_method = method == http::Method::GET
            || method == http::Method::HEAD
            || method == http::Method::OPTIONS
            || method == http::Method::TRACE
            || method == http::Method::DELETE;
        let body_is_empty =
            matches!(content_length, Some(0)) || (content_length.is_none() && bodyless_method);
        let mut outbound_body = if body_is_empty {
            OutboundBody::Empty
        } else if content_length.is_some() {
            match body.collect().await {
                Ok(collected) => OutboundBody::Replay(collected.to_bytes()),
                Err(e) => {
                    let e: BoxError = e.into();
                    debug!("proxy: failed to read request body, error={}", e);
                    return self
                        .error_response(StatusCode::BAD_REQUEST, "failed to read request body");
                }
            }
        } else {
            OutboundBody::Stream(Some(body.map_err(Into::into).boxed()))
        };
        let safe_method = method == http::Method::GET
            || method == http::Method::HEAD
            || method == http::Method::OPTIONS;
        let idempotent = safe_method || matches!(outbound_body, OutboundBody::Empty);

        let selection_input = SelectionInput {
            remote_addr: meta.peer,
            uri: &uri,
            headers: &headers,
            tls: meta.tls,
        };
        let endpoints = meta.peer.zip(meta.local);

        let mut last_err = ProxyError::NoUpstream;
        let mut affinity_cookie: Option<String> = None;
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            match self.policy.select(&self.pool, &selection_input) {
                None => {
                    last_err = ProxyError::NoUpstream;
                    debug!("proxy: no available upstream, attempt={}", attempt);
                }
                Some(selection) => {
                    if selection.set_cookie.is_some() {
                        affinity_cookie = selection.set_cookie;
                    }
                    let upstream = self
                        .pool
                        .get(selection.index)
                        .expect("selection index in range");

                    let guard = RequestGuard::new(upstream);
                    let dial = DialInfo::new(upstream);

                    let mut out_req = Request::new(match &mut outbound_body {
                        OutboundBody::Empty => empty_body(),
                        OutboundBody::Replay(bytes) => full_body(bytes.clone()),
                        OutboundBody::Stream(slot) => slot.take().unwrap_or_else(empty_body),
                    });
                    *out_req.method_mut() = method.clone();
                    *out_req.uri_mut() = uri.clone();
                    *out_req.headers_mut() = headers.clone();

                    let rt_start = Instant::now();
                    let result = self.transport.round_trip(out_req, &dial, endpoints).await;
                    let latency = rt_start.elapsed();

                    match result {
                        Ok(resp) => {
                            let status = resp.status().as_u16();
                            if let Some(b) = upstream.breaker() {
                                b.record(status, latency);
                            }
                            if let Some(p) = &self.passive {
                                p.observe(upstream, status, latency);
                            }

                            let can_replay = !matches!(
                                outbound_body,
                                OutboundBody::Stream(None)
                            );
                            if self.retry_on_statuses.contains(status) && can_replay {
                                debug!(
                                    "proxy: retrying on status, upstream={}, status={}, attempt={}",
                                    upstream.addr(),
                                    status,
                                    attempt
                                );
                                metrics::counter!(
                                    "proxy_upstream_retries_total",
                                    "reason" => "status",
                                )
                                .increment(1);
                                last_err = ProxyError::Transport {
                                    message: format!("upstream responded {}", status),
                                    post_write: true,
                                };
                            } else if status == StatusCode::SWITCHING_PROTOCOLS.as_u16() {
                                return self.finish_upgrade(
                                    downstream_upgrade,
                                    upgrade_requested.as_deref().unwrap_or(""),
                                    resp,
                                    upstream,
                                    guard,
                                    meta,
                                    start,
                                );
                            } else {
                                return self.finish_response(
                                    resp,
                                    guard,
                                    upstream,
                                    affinity_cookie,
                                    version,
                                    accept_encoding.as_deref(),
                                    &method,
                                    &uri,
                                    meta,
                                    start,
                                    latency,
                                );
                            }
                        }
                        Err(ProxyError::ClientCancelled) => {
                            // The client is gone: nothing to answer, and the
                            // aborted round-trip says nothing about upstream
                            // health.
                            debug!(
                                "proxy: client cancelled request, upstream={}, attempt={}",
                                upstream.addr(),
                                attempt
                            );
                            return self.error_response(
                                StatusCode::BAD_GATEWAY,
                                &ProxyError::ClientCancelled.to_string(),
                            );
                        }
                        Err(e) => {
                            if let Some(b) = upstream.breaker() {
                                b.record(0, latency);
                            }
                            if let Some(p) = &self.passive {
                                p.count_failure(upstream, 0, latency);
                            }
                            warn!(
                                "proxy: upstream error, upstream={}, attempt={}, error={}",
                                upstream.addr(),
                                attempt,
                                e
                            );

                            let can_replay =
                                !matches!(outbound_body, OutboundBody::Stream(None));
                            let retryable = e.retryable(idempotent) && can_replay;
                            if retryable {
                                metrics::counter!(
                                    "proxy_upstream_retries_total",
                                    "reason" => "transport_error",
                                )
                                .increment(1);
                            }
                            last_err = e;
                            if !retryable {
                                break;
                            }
                        }
                    }
                }
            }

            if start.elapsed() >= self.try_duration {
                break;
            }
            tokio::time::sleep(self.try_interval).await;
        }

        let message = if matches!(last_err, ProxyError::NoUpstream) && !self.fail_message.is_empty()
        {
            self.fail_message.clone()
        } else {
            last_err.to_string()
        };
        self.error_response(StatusCode::BAD_GATEWAY, &message)
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_response(
        &self,
        resp: Response<hyper::body::Incoming>,
        guard: RequestGuard,
        upstream: &Upstream,
        affinity_cookie: Option<String>,
        req_version: http::Version,
        accept_encoding: Option<&str>,
        method: &http::Method,
        uri: &http::Uri,
        meta: RequestMeta,
        start: Instant,
        upstream_latency: Duration,
    ) -> Response<BoxBody> {
        let (mut parts, body) = resp.into_parts();
        let status = parts.status;

        // Trailer announcements survive the hop-by-hop sweep.
        let announced: Vec<HeaderValue> =
            parts.headers.get_all(header::TRAILER).iter().cloned().collect();
        prepare::strip_response_hop_headers(&mut parts.headers);
        for value in announced {
            parts.headers.append(header::TRAILER, value);
        }

        apply_ops(&self.response_ops, &mut parts.headers);

        if let Some(cookie) = affinity_cookie {
            if let Ok(v) = HeaderValue::from_str(&cookie) {
                parts.headers.append(header::SET_COOKIE, v);
            }
        }

        let policy = flush_policy(
            self.flush_interval,
            req_version,
            accept_encoding,
            parts.version,
            &parts.headers,
        );
        let relayed = relay_body(body.map_err(|e| Box::new(e) as BoxError).boxed(), policy);
        let guarded = GuardedBody {
            inner: relayed,
            _guard: guard,
        }
        .boxed();

        metrics::histogram!(
            "proxy_upstream_request_duration_seconds",
            "upstream" => upstream.addr().to_string(),
        )
        .record(upstream_latency.as_secs_f64());

        info!(
            client_ip = %meta.peer.map(|p| p.ip().to_string()).unwrap_or_default(),
            method = %method,
            path = %uri.path(),
            status = status.as_u16(),
            upstream = %upstream.addr(),
            latency_ms = %start.elapsed().as_millis(),
            upstream_ms = %upstream_latency.as_millis(),
            "access"
        );

        Response::from_parts(parts, guarded)
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_upgrade(
        &self,
        downstream: Option<hyper::upgrade::OnUpgrade>,
        requested: &str,
        resp: Response<hyper::body::Incoming>,
        upstream: &Upstream,
        guard: RequestGuard,
        meta: RequestMeta,
        start: Instant,
    ) -> Response<BoxBody> {
        let Some(downstream) = downstream else {
            warn!(
                "proxy: upgrade: downstream connection cannot be hijacked, upstream={}",
                upstream.addr()
            );
            return self.error_response(
                StatusCode::BAD_GATEWAY,
                "downstream connection does not support protocol upgrades",
            );
        };

        match upgrade::handle_upgrade(
            downstream,
            requested,
            resp,
            self.streams.clone(),
            move || drop(guard),
        ) {
            Ok(resp) => {
                info!(
                    client_ip = %meta.peer.map(|p| p.ip().to_string()).unwrap_or_default(),
                    upstream = %upstream.addr(),
                    protocol = %requested,
                    latency_ms = %start.elapsed().as_millis(),
                    "upgrade"
                );
                resp
            }
            Err(e) => {
                warn!(
                    "proxy: upgrade failed, upstream={}, error={}",
                    upstream.addr(),
                    e
                );
                self.error_response(StatusCode::BAD_GATEWAY, &e.to_string())
            }
        }
    }

    fn error_response(&self, status: StatusCode, message: &str) -> Response<BoxBody> {
        Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(full_body(message.to_string()))
            .expect("static response")
    }
}

/// Replayability of the request body across attempts.
enum OutboundBody {
    Empty,
    Replay(Bytes),
    Stream(Option<BoxBody>),
}

/// RAII in-flight counter: increments on selection, decrements when the
/// response (or upgrade session) is done with the upstream — including
/// client cancellation, which drops the response body mid-flight.
struct RequestGuard {
    host: Arc<crate::upstream::Host>,
}

impl RequestGuard {
    fn new(upstream: &Upstream) -> Self {
        let host = upstream.host().clone();
        if let Err(e) = host.add_requests(1) {
            warn!("proxy: {}", e);
        }
        Self { host }
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        if let Err(e) = self.host.add_requests(-1) {
            warn!("proxy: {}", e);
        }
    }
}

/// Response body wrapper that owns the request guard for its lifetime.
struct GuardedBody {
    inner: BoxBody,
    _guard: RequestGuard,
}

impl Body for GuardedBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
        Pin::new(&mut self.inner).poll_frame(cx)
    }
}

fn compile_ops(cfgs: &[HeaderOpConfig]) -> Result<Vec<HeaderOp>, ProxyError> {
    cfgs.iter()
        .map(|cfg| {
            let name: HeaderName = cfg
                .name
                .parse()
                .map_err(|e| ProxyError::Config(format!("bad header name {:?}: {}", cfg.name, e)))?;
            let value: HeaderValue = cfg.value.parse().map_err(|e| {
                ProxyError::Config(format!("bad header value for {:?}: {}", cfg.name, e))
            })?;
            let action = match cfg.action.as_str() {
                "add" => HeaderAction::Add,
                "remove" => HeaderAction::Remove,
                _ => HeaderAction::Set,
            };
            Ok(HeaderOp {
                name,
                value,
                action,
            })
        })
        .collect()
}

fn apply_ops(ops: &[HeaderOp], headers: &mut http::HeaderMap) {
    for op in ops {
        match op.action {
            HeaderAction::Set => {
                headers.insert(op.name.clone(), op.value.clone());
            }
            HeaderAction::Add => {
                headers.append(op.name.clone(), op.value.clone());
            }
            HeaderAction::Remove => {
                headers.remove(&op.name);
            }
        }
    }
}
