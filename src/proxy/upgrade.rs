use crate::error::ProxyError;
use crate::proxy::{empty_body, prepare, BoxBody};
use hyper::body::Incoming;
use hyper::upgrade::OnUpgrade;
use hyper::Response;
use hyper_util::rt::TokioIo;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;
use tracing::{debug, error, info};

/// Tracks live upgraded (hijacked) sessions so server shutdown can close
/// them. Sessions park on the shared `Notify`; `shutdown_all` wakes them
/// after the configured grace period.
pub struct StreamRegistry {
    shutdown: Notify,
    closing: AtomicBool,
    active: AtomicUsize,
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self {
            shutdown: Notify::new(),
            closing: AtomicBool::new(false),
            active: AtomicUsize::new(0),
        }
    }
}

impl StreamRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Begin shutdown: after `delay`, every registered stream is told to
    /// close (WebSocket sessions get a Close frame first).
    pub async fn shutdown_all(&self, delay: Duration) {
        self.closing.store(true, Ordering::Release);
        if !delay.is_zero() {
            info!(
                "proxy: upgrade: delaying stream close, delay={:?}, active={}",
                delay,
                self.active()
            );
            tokio::time::sleep(delay).await;
        }
        self.shutdown.notify_waiters();
    }
}

/// A 1001 "going away" WebSocket Close control frame. The proxy masks the
/// frame when it speaks as a client (toward the backend) and leaves it
/// unmasked when it speaks as a server (toward the downstream user);
/// well-behaved peers drop the connection on a wrong masking bit.
pub fn close_frame(masked: bool) -> Vec<u8> {
    let payload = 1001u16.to_be_bytes();
    let mut frame = Vec::with_capacity(8);
    frame.push(0x88); // FIN + close opcode
    if masked {
        frame.push(0x80 | 0x02);
        let key: [u8; 4] = rand::random();
        frame.extend_from_slice(&key);
        frame.push(payload[0] ^ key[0]);
        frame.push(payload[1] ^ key[1]);
    } else {
        frame.push(0x02);
        frame.extend_from_slice(&payload);
    }
    frame
}

/// The backend must switch to the protocol the client asked for: printable
/// ASCII and a case-insensitive match.
fn validate_tokens(requested: &str, offered: &str) -> Result<(), ProxyError> {
    let printable = |s: &str| s.bytes().all(|b| (0x20..=0x7e).contains(&b));
    if requested.is_empty()
        || offered.is_empty()
        || !printable(offered)
        || !offered.eq_ignore_ascii_case(requested)
    {
        return Err(ProxyError::UpgradeMismatch {
            requested: requested.to_string(),
            offered: offered.to_string(),
        });
    }
    Ok(())
}

/// Handle a backend 101: validate the protocol switch, answer 101
/// downstream, and splice the two raw streams until either side closes or
/// the server shuts down.
pub fn handle_upgrade(
    downstream: OnUpgrade,
    requested: &str,
    mut resp: Response<Incoming>,
    registry: Arc<StreamRegistry>,
    on_done: impl FnOnce() + Send + 'static,
) -> Result<Response<BoxBody>, ProxyError> {
    let offered = prepare::upgrade_token(resp.headers()).unwrap_or_default();
    validate_tokens(requested, &offered)?;
    let websocket = offered.eq_ignore_ascii_case("websocket");

    let upstream = resp
        .extensions_mut()
        .remove::<OnUpgrade>()
        .ok_or_else(|| ProxyError::Transport {
            message: "backend connection cannot be hijacked".to_string(),
            post_write: true,
        })?;

    // Mirror the backend's 101 headers downstream before the hijack.
    let mut downstream_resp = Response::builder()
        .status(http::StatusCode::SWITCHING_PROTOCOLS)
        .body(empty_body())
        .expect("static response");
    *downstream_resp.headers_mut() = resp.headers().clone();

    tokio::spawn(async move {
        let _done = CallOnDrop(Some(on_done));

        let client_io = match downstream.await {
            Ok(io) => io,
            Err(e) => {
                error!("proxy: upgrade: downstream hijack failed, error={}", e);
                return;
            }
        };
        let backend_io = match upstream.await {
            Ok(io) => io,
            Err(e) => {
                error!("proxy: upgrade: backend hijack failed, error={}", e);
                return;
            }
        };

        let mut client = TokioIo::new(client_io);
        let mut backend = TokioIo::new(backend_io);

        registry.active.fetch_add(1, Ordering::Relaxed);
        metrics::gauge!("proxy_upgraded_streams_active").increment(1.0);

        let spliced = if registry.closing() {
            None
        } else {
            tokio::select! {
                r = tokio::io::copy_bidirectional(&mut client, &mut backend) => Some(r),
                _ = registry.shutdown.notified() => None,
            }
        };

        match spliced {
            Some(Ok((to_backend, to_client))) => {
                debug!(
                    "proxy: upgrade: stream ended, client_to_backend={}, backend_to_client={}",
                    to_backend, to_client
                );
            }
            Some(Err(e)) => {
                debug!("proxy: upgrade: stream error, error={}", e);
            }
            None => {
                if websocket {
                    // Best effort: we are the client toward the backend
                    // (masked) and the server toward the user (unmasked).
                    let _ = backend.write_all(&close_frame(true)).await;
                    let _ = client.write_all(&close_frame(false)).await;
                }
                debug!("proxy: upgrade: stream closed by shutdown");
            }
        }

        registry.active.fetch_sub(1, Ordering::Relaxed);
        metrics::gauge!("proxy_upgraded_streams_active").decrement(1.0);
    });

    Ok(downstream_resp)
}

struct CallOnDrop<F: FnOnce()>(Option<F>);

impl<F: FnOnce()> Drop for CallOnDrop<F> {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_match_is_case_insensitive() {
        validate_tokens("websocket", "WebSocket").unwrap();
        validate_tokens("websocket", "websocket").unwrap();
    }

    #[test]
    fn test_token_mismatch_rejected() {
        let err = validate_tokens("websocket", "h2c").unwrap_err();
        assert!(matches!(err, ProxyError::UpgradeMismatch { .. }));
        assert!(validate_tokens("websocket", "").is_err());
        assert!(validate_tokens("", "websocket").is_err());
    }

    #[test]
    fn test_non_printable_token_rejected() {
        assert!(validate_tokens("websocket", "web\u{7f}socket").is_err());
    }

    #[test]
    fn test_unmasked_close_frame() {
        let frame = close_frame(false);
        assert_eq!(frame, vec![0x88, 0x02, 0x03, 0xe9]);
    }

    #[test]
    fn test_masked_close_frame_unmasks_to_1001() {
        let frame = close_frame(true);
        assert_eq!(frame.len(), 8);
        assert_eq!(frame[0], 0x88);
        assert_eq!(frame[1], 0x82); // mask bit + length 2
        let key = &frame[2..6];
        let code = u16::from_be_bytes([frame[6] ^ key[0], frame[7] ^ key[1]]);
        assert_eq!(code, 1001);
    }

    #[test]
    fn test_registry_shutdown_flags() {
        let registry = StreamRegistry::new();
        assert!(!registry.closing());
        assert_eq!(registry.active(), 0);

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        rt.block_on(registry.shutdown_all(Duration::ZERO));
        assert!(registry.closing());
    }
}
