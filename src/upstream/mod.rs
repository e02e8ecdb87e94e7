pub mod circuit_breaker;
pub mod health;
pub mod host;
pub mod passive;
pub mod policy;
pub mod pool;

pub use circuit_breaker::CircuitBreaker;
pub use health::{spawn_health_gauge_reporter, ActiveHealthChecker};
pub use host::Host;
pub use passive::PassiveHealth;
pub use policy::{Policy, Selection, SelectionInput};
pub use pool::{DialAddress, DialInfo, Upstream, UpstreamPool};
