use std::fmt;

/// Errors produced by the forwarding path. Tagged kinds rather than opaque
/// strings so the try-loop can classify retryability without string matching.
#[derive(Debug)]
pub enum ProxyError {
    /// No upstream passed the availability filter at this attempt.
    NoUpstream,
    /// The transport failed before any bytes reached the backend.
    Dial(String),
    /// The transport failed after the request may have been written.
    /// `post_write` gates retry to idempotent requests.
    Transport { message: String, post_write: bool },
    /// The backend answered 101 with a different Upgrade token than the
    /// client requested.
    UpgradeMismatch { requested: String, offered: String },
    /// The client went away; not an error upward.
    ClientCancelled,
    /// A host counter would have gone negative.
    CounterUnderflow { counter: &'static str, addr: String },
    /// An active health probe failed to complete.
    HealthProbe(String),
    Config(String),
}

impl ProxyError {
    /// Whether the try-loop may attempt another upstream for this error.
    /// `idempotent` describes the request being forwarded (safe method or
    /// empty body).
    pub fn retryable(&self, idempotent: bool) -> bool {
        match self {
            ProxyError::NoUpstream => true,
            ProxyError::Dial(_) => true,
            ProxyError::Transport { post_write, .. } => !post_write || idempotent,
            _ => false,
        }
    }
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::NoUpstream => write!(f, "no upstreams available"),
            ProxyError::Dial(msg) => write!(f, "dial error: {}", msg),
            ProxyError::Transport { message, .. } => write!(f, "transport error: {}", message),
            ProxyError::UpgradeMismatch { requested, offered } => write!(
                f,
                "backend tried to switch protocol {:?} when {:?} was requested",
                offered, requested
            ),
            ProxyError::ClientCancelled => write!(f, "client cancelled request"),
            ProxyError::CounterUnderflow { counter, addr } => {
                write!(f, "counter underflow: {} for host {}", counter, addr)
            }
            ProxyError::HealthProbe(msg) => write!(f, "health probe error: {}", msg),
            ProxyError::Config(msg) => write!(f, "config error: {}", msg),
        }
    }
}

impl std::error::Error for ProxyError {}
