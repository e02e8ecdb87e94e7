pub mod admin;
pub mod bootstrap;
pub mod runtime;

use crate::proxy::{Handler, RequestMeta};
use anyhow::Result;
use arc_swap::ArcSwap;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::convert::Infallible;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{error, info};

/// Shared server state. The handler sits behind an `ArcSwap` so a config
/// reload can atomically replace the whole pool+policy+transport bundle
/// while in-flight requests keep the old one alive through their `Arc`.
#[derive(Clone)]
pub struct ProxyState {
    pub handler: Arc<ArcSwap<Handler>>,
    pub metrics: Option<crate::metrics::Metrics>,
}

impl ProxyState {
    pub fn new(handler: Handler) -> Self {
        Self {
            handler: Arc::new(ArcSwap::from_pointee(handler)),
            metrics: None,
        }
    }
}

/// Run the proxy accept loop on an already-bound listener (binding is the
/// caller's job, which also makes the port observable in tests). When
/// `shutdown` is notified the loop stops accepting and drains in-flight
/// connections for up to `DRAIN_TIMEOUT`.
pub async fn serve(listener: TcpListener, state: ProxyState, shutdown: Arc<Notify>) -> Result<()> {
    const DRAIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

    let local_addr = listener.local_addr().ok();
    info!(
        "server: proxy listening, addr={}",
        local_addr.map(|a| a.to_string()).unwrap_or_default()
    );

    let active_conns = Arc::new(AtomicI64::new(0));

    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = shutdown.notified() => {
                info!("server: proxy: stop accepting new connections, draining...");
                break;
            }
        };

        let (stream, peer_addr) = match accepted {
            Ok(v) => {
                metrics::counter!("proxy_connections_total", "status" => "accepted").increment(1);
                v
            }
            Err(e) => {
                error!("server: proxy: accept failed, error={}", e);
                metrics::counter!("proxy_connections_total", "status" => "error").increment(1);
                continue;
            }
        };

        metrics::gauge!("proxy_connections_active").increment(1.0);
        active_conns.fetch_add(1, Ordering::Relaxed);

        let state = state.clone();
        let active_conns = active_conns.clone();

        tokio::spawn(async move {
            let meta = RequestMeta {
                peer: Some(peer_addr),
                local: local_addr,
                tls: false,
            };
            let io = TokioIo::new(stream);
            let handler_cell = state.handler.clone();
            let svc = service_fn(move |req: Request<Incoming>| {
                let handler = handler_cell.load_full();
                async move { Ok::<_, Infallible>(handler.handle(req, meta).await) }
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .http1()
                .keep_alive(true)
                .http2()
                .keep_alive_interval(Some(std::time::Duration::from_secs(20)))
                .serve_connection_with_upgrades(io, svc)
                .await
            {
                let msg = e.to_string();
                if !msg.contains("connection closed") {
                    error!(
                        "server: proxy: connection error, peer={}, error={}",
                        peer_addr, msg
                    );
                }
            }

            metrics::gauge!("proxy_connections_active").decrement(1.0);
            active_conns.fetch_sub(1, Ordering::Relaxed);
        });
    }

    // Drain phase: wait for in-flight connections, then give up.
    let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
    loop {
        let active = active_conns.load(Ordering::Relaxed);
        if active == 0 {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            info!(
                "server: proxy: drain timeout with {} connections still active",
                active
            );
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }

    info!("server: proxy: drained");
    Ok(())
}
