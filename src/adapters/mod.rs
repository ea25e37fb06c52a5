pub mod admin;
pub mod health_checker;
pub mod http_handler;
pub mod middleware;
pub mod proxy;
pub mod rewrite;

/// Re-export commonly used types from adapters
pub use health_checker::HealthProber;
pub use http_handler::GatewayHandler;
pub use proxy::{ProxyEngine, ProxyEngineOptions};
