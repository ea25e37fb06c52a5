use async_trait::async_trait;
use axum::body::Body;
use hyper::{Request, Response};
use thiserror::Error;

/// Custom error type for upstream HTTP operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpClientError {
    /// Dial or transport failure toward the upstream (maps to 502)
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// The upstream exceeded its deadline (maps to 504)
    #[error("Timeout after {0:?}")]
    Timeout(std::time::Duration),

    /// The outbound request could not be constructed
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Result type alias for upstream HTTP operations
pub type HttpClientResult<T> = Result<T, HttpClientError>;

/// HttpClient defines the port (interface) for forwarding requests to
/// upstream endpoints. The protocol adapter and the health prober both speak
/// through this seam so tests can substitute a mock.
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    /// Forward a fully rewritten request to the upstream named by its URI.
    /// The response body streams; callers must not assume it is buffered.
    async fn send_request(&self, req: Request<Body>) -> HttpClientResult<Response<Body>>;

    /// Probe `url` with a GET, bounded by `timeout`. Returns whether the
    /// endpoint answered with a 2xx/3xx status.
    async fn health_check(
        &self,
        url: &str,
        timeout: std::time::Duration,
    ) -> HttpClientResult<bool>;
}
