pub mod auth;
pub mod circuit_breaker;
pub mod cluster;
pub mod compiler;
pub mod filter;
pub mod rate_limiter;
pub mod snapshot;

pub use circuit_breaker::{BreakerState, CircuitBreaker};
pub use rate_limiter::SlidingWindowLimiter;
pub use snapshot::{Snapshot, SnapshotStore};
