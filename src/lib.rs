pub mod config;
pub mod error;
pub mod metrics;
pub mod proxy;
pub mod server;
pub mod transport;
pub mod upstream;

pub use error::ProxyError;
pub use proxy::{Handler, RequestMeta};
