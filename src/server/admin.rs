use super::ProxyState;
use crate::proxy::{full_body, BoxBody};
use anyhow::Result;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{error, info};

/// Admin surface: liveness, readiness, Prometheus metrics, and a JSON view
/// of the upstream pool's live state.
pub fn handle_admin(req: Request<Incoming>, state: ProxyState) -> Response<BoxBody> {
    match req.uri().path() {
        "/health" | "/healthz" => Response::builder()
            .status(200)
            .header("content-type", "application/json")
            .body(full_body(r#"{"status":"ok"}"#))
            .unwrap(),

        "/ready" | "/readyz" => {
            let handler = state.handler.load();
            let available = handler.pool().iter().filter(|u| u.available()).count();
            let status = if available > 0 { 200 } else { 503 };
            Response::builder()
                .status(status)
                .header("content-type", "application/json")
                .body(full_body(format!(
                    r#"{{"status":{:?},"upstreams":{},"available":{}}}"#,
                    if available > 0 { "ready" } else { "degraded" },
                    handler.pool().len(),
                    available,
                )))
                .unwrap()
        }

        "/metrics" => {
            let body = state
                .metrics
                .as_ref()
                .map(|m| m.render())
                .unwrap_or_default();
            Response::builder()
                .status(200)
                .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
                .body(full_body(body))
                .unwrap()
        }

        "/upstreams" => {
            let handler = state.handler.load();
            let upstreams: Vec<serde_json::Value> = handler
                .pool()
                .iter()
                .map(|u| {
                    serde_json::json!({
                        "address": u.addr(),
                        "healthy": u.healthy(),
                        "available": u.available(),
                        "num_requests": u.num_requests(),
                        "fails": u.host().fails(),
                        "max_requests": u.max_requests(),
                    })
                })
                .collect();
            let body = serde_json::to_string_pretty(&upstreams).unwrap_or_default();
            Response::builder()
                .status(200)
                .header("content-type", "application/json")
                .body(full_body(body))
                .unwrap()
        }

        _ => Response::builder()
            .status(404)
            .header("content-type", "application/json")
            .body(full_body(r#"{"error":"not found"}"#))
            .unwrap(),
    }
}

pub async fn run_admin_server(
    listen: &str,
    state: ProxyState,
    shutdown: Arc<Notify>,
) -> Result<()> {
    let listener = TcpListener::bind(listen).await?;
    info!("server: admin listening, addr={}", listener.local_addr()?);

    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = shutdown.notified() => return Ok(()),
        };
        let (stream, _) = match accepted {
            Ok(v) => v,
            Err(e) => {
                error!("server: admin: accept failed, error={}", e);
                continue;
            }
        };

        let state = state.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let svc = service_fn(move |req: Request<Incoming>| {
                let state = state.clone();
                async move { Ok::<_, Infallible>(handle_admin(req, state)) }
            });
            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .serve_connection(io, svc)
                .await
            {
                tracing::debug!("server: admin: connection error, error={}", e);
            }
        });
    }
}
