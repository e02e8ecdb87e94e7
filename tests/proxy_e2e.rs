//! End-to-end forwarding tests against in-process HTTP backends.

use bytes::Bytes;
use charon_proxy::config::{
    HandlerConfig, HealthChecksConfig, PassiveHealthConfig, SelectionConfig, StatusCodeSet,
    StatusRange, UpstreamConfig,
};
use charon_proxy::proxy::{Handler, RequestMeta};
use charon_proxy::server::{self, ProxyState};
use http::{Request, Response};
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

const PEER: &str = "203.0.113.50:47001";

async fn http_backend<F, Fut, B>(f: F) -> SocketAddr
where
    F: Fn(Request<Incoming>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Response<B>> + Send + 'static,
    B: hyper::body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let f = f.clone();
            tokio::spawn(async move {
                let svc = service_fn(move |req| {
                    let f = f.clone();
                    async move { Ok::<_, std::convert::Infallible>(f(req).await) }
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), svc)
                    .await;
            });
        }
    });
    addr
}

/// Backend answering every request with its own name, optionally slowly.
async fn named_backend(
    name: &'static str,
    hits: Arc<AtomicUsize>,
    delay: Duration,
) -> SocketAddr {
    http_backend(move |_req| {
        let hits = hits.clone();
        async move {
            hits.fetch_add(1, Ordering::SeqCst);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Response::new(Full::new(Bytes::from_static(name.as_bytes())))
        }
    })
    .await
}

fn handler_for(dials: &[SocketAddr], policy: &str) -> Handler {
    build_handler(dials, policy, |_| {})
}

fn build_handler(
    dials: &[SocketAddr],
    policy: &str,
    customize: impl FnOnce(&mut HandlerConfig),
) -> Handler {
    let mut cfg = HandlerConfig {
        upstreams: dials
            .iter()
            .map(|addr| UpstreamConfig {
                dial: addr.to_string(),
                max_requests: 0,
                weight: 1,
            })
            .collect(),
        selection: SelectionConfig {
            policy: policy.to_string(),
            ..Default::default()
        },
        ..Default::default()
    };
    customize(&mut cfg);
    Handler::new(&cfg).unwrap()
}

fn meta() -> RequestMeta {
    RequestMeta {
        peer: Some(PEER.parse().unwrap()),
        local: None,
        tls: false,
    }
}

async fn get(handler: &Handler, path: &str) -> (u16, String) {
    let req = Request::builder()
        .method(http::Method::GET)
        .uri(path)
        .header(http::header::HOST, "proxy.test")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let resp = handler.handle(req, meta()).await;
    let status = resp.status().as_u16();
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8_lossy(&body).into_owned())
}

#[tokio::test]
async fn round_robin_skips_unhealthy_upstream() {
    let hits = Arc::new(AtomicUsize::new(0));
    let a = named_backend("A", hits.clone(), Duration::ZERO).await;
    let b = named_backend("B", hits.clone(), Duration::ZERO).await;
    let c = named_backend("C", hits.clone(), Duration::ZERO).await;

    let handler = handler_for(&[a, b, c], "round_robin");
    handler.pool().get(1).unwrap().host().set_healthy(false);

    let mut bodies = Vec::new();
    for _ in 0..3 {
        let (status, body) = get(&handler, "/").await;
        assert_eq!(status, 200);
        bodies.push(body);
    }
    assert_eq!(bodies, vec!["A", "C", "A"]);

    // In-flight counters return to zero once the responses are consumed.
    for up in handler.pool().iter() {
        assert_eq!(up.num_requests(), 0);
    }
}

#[tokio::test]
async fn ip_hash_is_stable_across_pool_resize() {
    let hits = Arc::new(AtomicUsize::new(0));
    let a = named_backend("A", hits.clone(), Duration::ZERO).await;
    let b = named_backend("B", hits.clone(), Duration::ZERO).await;

    let handler = handler_for(&[a, b], "ip_hash");
    let mut first = Vec::new();
    for _ in 0..4 {
        let (status, body) = get(&handler, "/").await;
        assert_eq!(status, 200);
        first.push(body);
    }
    assert!(
        first.windows(2).all(|w| w[0] == w[1]),
        "same remote must map to the same upstream: {:?}",
        first
    );

    // Replace the pool with a larger one: the mapping may move, but it
    // must stay deterministic for the same remote IP.
    let c = named_backend("C", hits.clone(), Duration::ZERO).await;
    let resized = handler_for(&[a, b, c], "ip_hash");
    let mut second = Vec::new();
    for _ in 0..4 {
        let (status, body) = get(&resized, "/").await;
        assert_eq!(status, 200);
        second.push(body);
    }
    assert!(
        second.windows(2).all(|w| w[0] == w[1]),
        "resized pool must still map consistently: {:?}",
        second
    );
}

#[tokio::test]
async fn passive_latency_failures_mark_upstream_unhealthy() {
    let hits = Arc::new(AtomicUsize::new(0));
    let slow = named_backend("A", hits.clone(), Duration::from_millis(100)).await;
    let fast = named_backend("B", hits.clone(), Duration::from_millis(1)).await;

    let handler = build_handler(&[slow, fast], "first_available", |cfg| {
        cfg.health_checks = HealthChecksConfig {
            active: None,
            passive: Some(PassiveHealthConfig {
                max_fails: 2,
                unhealthy_latency: Duration::from_millis(50),
                ..Default::default()
            }),
        };
    });

    let (_, body) = get(&handler, "/").await;
    assert_eq!(body, "A");
    assert_eq!(handler.pool().get(0).unwrap().host().fails(), 1);

    let (_, body) = get(&handler, "/").await;
    assert_eq!(body, "A");
    assert_eq!(handler.pool().get(0).unwrap().host().fails(), 2);
    assert!(!handler.pool().get(0).unwrap().available());

    // A is now skipped until the failures decay.
    let (_, body) = get(&handler, "/").await;
    assert_eq!(body, "B");
}

#[tokio::test]
async fn try_duration_exhausts_with_502() {
    // Backend accepts and instantly closes: every attempt fails before a
    // response arrives, which is retryable.
    let attempts = Arc::new(AtomicUsize::new(0));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    {
        let attempts = attempts.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                attempts.fetch_add(1, Ordering::SeqCst);
                drop(stream);
            }
        });
    }

    let handler = build_handler(&[addr], "first_available", |cfg| {
        cfg.try_duration = Duration::from_millis(100);
        cfg.try_interval = Duration::from_millis(20);
    });

    let start = Instant::now();
    let (status, body) = get(&handler, "/").await;
    let elapsed = start.elapsed();

    assert_eq!(status, 502);
    assert!(!body.is_empty());
    assert!(elapsed >= Duration::from_millis(100), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(1), "elapsed {:?}", elapsed);

    let n = attempts.load(Ordering::SeqCst);
    assert!((3..=8).contains(&n), "expected ~5 attempts, got {}", n);
    assert_eq!(handler.pool().get(0).unwrap().num_requests(), 0);
}

#[tokio::test]
async fn try_duration_zero_means_single_attempt() {
    let hits = Arc::new(AtomicUsize::new(0));
    let addr = {
        let hits = hits.clone();
        http_backend(move |_req| {
            let hits = hits.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                Response::builder()
                    .status(500)
                    .body(Full::new(Bytes::from_static(b"boom")))
                    .unwrap()
            }
        })
        .await
    };

    let handler = build_handler(&[addr], "first_available", |cfg| {
        cfg.retry_on_statuses = StatusCodeSet(vec![StatusRange {
            start: 500,
            end: 500,
        }]);
        // try_duration stays zero: the retryable status still gets no
        // second attempt.
    });

    let (status, _) = get(&handler, "/").await;
    assert_eq!(status, 502);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn empty_pool_returns_502_without_spinning() {
    let handler = build_handler(&[], "random", |cfg| {
        cfg.fail_message = "no healthy upstreams".to_string();
    });
    let start = Instant::now();
    let (status, body) = get(&handler, "/").await;
    assert_eq!(status, 502);
    assert_eq!(body, "no healthy upstreams");
    assert!(start.elapsed() < Duration::from_millis(100));
}

#[tokio::test]
async fn client_cancel_mid_stream_releases_counters() {
    // Backend streams a chunk every 50ms, forever.
    let addr = http_backend(move |_req| async move {
        let stream = futures_util::stream::unfold(0u64, |n| async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let frame: Result<Frame<Bytes>, std::convert::Infallible> =
                Ok(Frame::data(Bytes::from(format!("chunk-{}\n", n))));
            Some((frame, n + 1))
        });
        Response::new(StreamBody::new(stream))
    })
    .await;

    let handler = handler_for(&[addr], "first_available");

    let req = Request::builder()
        .uri("/stream")
        .header(http::header::HOST, "proxy.test")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let resp = handler.handle(req, meta()).await;
    assert_eq!(resp.status(), 200);
    assert_eq!(handler.pool().get(0).unwrap().num_requests(), 1);

    let mut body = resp.into_body();
    let first = body.frame().await.unwrap().unwrap();
    assert!(first
        .into_data()
        .unwrap()
        .starts_with(b"chunk-0"));

    // The client walks away mid-stream.
    drop(body);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handler.pool().get(0).unwrap().num_requests(), 0);
}

/// Raw TCP backend that answers an upgrade handshake with 101 and then
/// echoes on the hijacked stream: reads 42 bytes, then writes its own 42.
async fn upgrade_backend(offered_protocol: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                loop {
                    let n = match stream.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    buf.extend_from_slice(&chunk[..n]);
                    if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                let resp = format!(
                    "HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: {}\r\n\r\n",
                    offered_protocol
                );
                if stream.write_all(resp.as_bytes()).await.is_err() {
                    return;
                }

                let mut inbound = [0u8; 42];
                if stream.read_exact(&mut inbound).await.is_err() {
                    return;
                }
                let outbound = [0x42u8; 42];
                let _ = stream.write_all(&outbound).await;
                // Hold the connection open so the client reads everything.
                tokio::time::sleep(Duration::from_secs(1)).await;
            });
        }
    });
    addr
}

async fn start_proxy(handler: Handler) -> (SocketAddr, Arc<Notify>) {
    let state = ProxyState::new(handler);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = Arc::new(Notify::new());
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let _ = server::serve(listener, state, shutdown).await;
        });
    }
    (addr, shutdown)
}

async fn read_response_head(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await.unwrap();
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

#[tokio::test]
async fn websocket_upgrade_relays_bytes_both_ways() {
    let backend = upgrade_backend("websocket").await;
    let handler = handler_for(&[backend], "first_available");
    let (proxy_addr, shutdown) = start_proxy(handler).await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client
        .write_all(
            b"GET /ws HTTP/1.1\r\nHost: proxy.test\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n",
        )
        .await
        .unwrap();

    let head = read_response_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 101"), "head: {}", head);
    assert!(head.to_lowercase().contains("upgrade: websocket"));

    // 42 bytes toward the backend, 42 bytes back.
    let outbound = [0x24u8; 42];
    client.write_all(&outbound).await.unwrap();
    let mut inbound = [0u8; 42];
    client.read_exact(&mut inbound).await.unwrap();
    assert_eq!(inbound, [0x42u8; 42]);

    shutdown.notify_waiters();
}

#[tokio::test]
async fn upgrade_protocol_mismatch_is_rejected() {
    let backend = upgrade_backend("h2c").await;
    let handler = handler_for(&[backend], "first_available");
    let (proxy_addr, shutdown) = start_proxy(handler).await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client
        .write_all(
            b"GET /ws HTTP/1.1\r\nHost: proxy.test\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n",
        )
        .await
        .unwrap();

    let head = read_response_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 502"), "head: {}", head);
}

#[tokio::test]
async fn cookie_hash_sets_and_honors_affinity_cookie() {
    let hits = Arc::new(AtomicUsize::new(0));
    let a = named_backend("A", hits.clone(), Duration::ZERO).await;
    let b = named_backend("B", hits.clone(), Duration::ZERO).await;

    let handler = build_handler(&[a, b], "cookie_hash", |cfg| {
        cfg.selection.field = "lb".to_string();
    });

    let req = Request::builder()
        .uri("/")
        .header(http::header::HOST, "proxy.test")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let resp = handler.handle(req, meta()).await;
    let cookie = resp
        .headers()
        .get(http::header::SET_COOKIE)
        .expect("first visit sets the affinity cookie")
        .to_str()
        .unwrap()
        .to_string();
    let first_body = resp.into_body().collect().await.unwrap().to_bytes();

    // Returning with the cookie pins to the same upstream, with no
    // Set-Cookie rewrite.
    for _ in 0..3 {
        let req = Request::builder()
            .uri("/")
            .header(http::header::HOST, "proxy.test")
            .header(http::header::COOKIE, cookie.clone())
            .body(Full::new(Bytes::new()))
            .unwrap();
        let resp = handler.handle(req, meta()).await;
        assert!(resp.headers().get(http::header::SET_COOKIE).is_none());
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, first_body);
    }
}

#[tokio::test]
async fn forwarded_headers_reach_the_backend() {
    let addr = http_backend(move |req: Request<Incoming>| async move {
        let xff = req
            .headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let xfh = req
            .headers()
            .get("x-forwarded-host")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        Response::new(Full::new(Bytes::from(format!("{}|{}", xff, xfh))))
    })
    .await;

    let handler = handler_for(&[addr], "first_available");
    let (_, body) = get(&handler, "/").await;
    assert_eq!(body, "203.0.113.50|proxy.test");
}

#[tokio::test]
async fn max_requests_cap_skips_full_upstream() {
    let hits = Arc::new(AtomicUsize::new(0));
    let slow = named_backend("A", hits.clone(), Duration::from_millis(200)).await;
    let fast = named_backend("B", hits.clone(), Duration::ZERO).await;

    let handler = Arc::new(build_handler(&[slow, fast], "first_available", |cfg| {
        cfg.upstreams[0].max_requests = 1;
    }));

    // Park one request on A so it reports Full.
    let parked = {
        let handler = handler.clone();
        tokio::spawn(async move { get(&handler, "/").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(handler.pool().get(0).unwrap().full());

    let (_, body) = get(&handler, "/").await;
    assert_eq!(body, "B");

    let (_, parked_body) = parked.await.unwrap();
    assert_eq!(parked_body, "A");
    assert!(!handler.pool().get(0).unwrap().full());
}
