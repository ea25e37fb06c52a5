//! The gateway middleware chain.
//!
//! A middleware wraps the next handler and returns a new handler; `chain`
//! composes an ordered list so index 0 runs outermost. Every layer (and the
//! terminal handler) sits behind a panic boundary: a panic is logged and
//! answered with a plain 500 instead of tearing down the connection task.
//!
//! Standard order: request-id → trace-context → logging → metrics →
//! rate-limit → auth, with the protocol adapter as the terminal handler.
use std::{net::SocketAddr, panic::AssertUnwindSafe, sync::Arc, time::Instant};

use axum::{body::Body, extract::ConnectInfo};
use futures_util::FutureExt;
use http::{HeaderValue, Request, Response, StatusCode, header};
use http_body::Body as HttpBody;
use uuid::Uuid;

use crate::{
    config::models::RateLimitKey,
    core::{
        auth::{Authenticator, Identity},
        rate_limiter::SlidingWindowLimiter,
    },
    metrics,
};

pub type BoxFuture<T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send>>;

/// A boxed async request handler. Cloning is cheap (Arc).
pub type Handler = Arc<dyn Fn(Request<Body>) -> BoxFuture<Response<Body>> + Send + Sync>;

/// A middleware produces a handler wrapping `next`.
pub trait Middleware: Send + Sync + 'static {
    fn wrap(&self, next: Handler) -> Handler;
}

/// Request-scoped id, inbound `X-Request-ID` or freshly generated.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// W3C trace id extracted from (or minted into) `traceparent`.
#[derive(Debug, Clone)]
pub struct TraceId(pub String);

/// Matched route name, set on the *response* extensions by the terminal
/// handler so outer middlewares can label metrics and logs.
#[derive(Debug, Clone)]
pub struct MatchedRoute(pub String);

/// Selected upstream cluster, also set on the response extensions.
#[derive(Debug, Clone)]
pub struct UpstreamName(pub String);

/// Compose `middlewares` around `terminal`, outermost first, with a panic
/// boundary around every layer.
pub fn chain(terminal: Handler, middlewares: &[Arc<dyn Middleware>]) -> Handler {
    let mut handler = recover_wrap(terminal);
    for middleware in middlewares.iter().rev() {
        handler = recover_wrap(middleware.wrap(handler));
    }
    handler
}

fn recover_wrap(next: Handler) -> Handler {
    Arc::new(move |req: Request<Body>| {
        let next = Arc::clone(&next);
        let path = req.uri().path().to_string();
        Box::pin(async move {
            match AssertUnwindSafe(next(req)).catch_unwind().await {
                Ok(response) => response,
                Err(panic) => {
                    tracing::error!(
                        path,
                        panic = panic_message(&panic),
                        "panic recovered in request pipeline"
                    );
                    plain_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
                }
            }
        })
    })
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn plain_response(status: StatusCode, body: &'static str) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::from(body))
        .unwrap_or_else(|_| Response::new(Body::from(body)))
}

fn json_response(status: StatusCode, error: &str, message: &str) -> Response<Body> {
    let body = serde_json::json!({ "error": error, "message": message }).to_string();
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap_or_else(|_| plain_response(status, "error"))
}

/// Ensures every request carries an id, echoed back in `X-Request-ID`.
pub struct RequestIdMiddleware;

impl Middleware for RequestIdMiddleware {
    fn wrap(&self, next: Handler) -> Handler {
        Arc::new(move |mut req: Request<Body>| {
            let next = Arc::clone(&next);
            Box::pin(async move {
                let id = req
                    .headers()
                    .get("x-request-id")
                    .and_then(|v| v.to_str().ok())
                    .filter(|v| !v.is_empty())
                    .map(str::to_string)
                    .unwrap_or_else(|| Uuid::new_v4().to_string());

                req.extensions_mut().insert(RequestId(id.clone()));
                let mut response = next(req).await;
                if let Ok(value) = HeaderValue::from_str(&id) {
                    response.headers_mut().insert("x-request-id", value);
                }
                response
            })
        })
    }
}

/// Ensures a W3C `traceparent` header exists and exposes the trace id.
pub struct TraceContextMiddleware;

impl TraceContextMiddleware {
    fn generate_traceparent() -> String {
        let mut trace_id = [0u8; 16];
        let mut span_id = [0u8; 8];
        rand::fill(&mut trace_id);
        rand::fill(&mut span_id);
        format!("00-{}-{}-01", hex(&trace_id), hex(&span_id))
    }

    /// traceparent format: "version-traceid-spanid-flags".
    fn extract_trace_id(traceparent: &str) -> Option<&str> {
        traceparent.split('-').nth(1)
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

impl Middleware for TraceContextMiddleware {
    fn wrap(&self, next: Handler) -> Handler {
        Arc::new(move |mut req: Request<Body>| {
            let next = Arc::clone(&next);
            Box::pin(async move {
                let traceparent = match req
                    .headers()
                    .get("traceparent")
                    .and_then(|v| v.to_str().ok())
                {
                    Some(existing) => existing.to_string(),
                    None => {
                        let minted = Self::generate_traceparent();
                        if let Ok(value) = HeaderValue::from_str(&minted) {
                            req.headers_mut().insert("traceparent", value);
                        }
                        minted
                    }
                };

                if let Some(trace_id) = Self::extract_trace_id(&traceparent) {
                    req.extensions_mut().insert(TraceId(trace_id.to_string()));
                }
                next(req).await
            })
        })
    }
}

/// Emits one structured access-log event per request.
pub struct LoggingMiddleware;

impl Middleware for LoggingMiddleware {
    fn wrap(&self, next: Handler) -> Handler {
        Arc::new(move |req: Request<Body>| {
            let next = Arc::clone(&next);
            Box::pin(async move {
                let start = Instant::now();
                let method = req.method().to_string();
                let path = req.uri().path().to_string();
                let host = req
                    .headers()
                    .get(header::HOST)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                let request_id = req
                    .extensions()
                    .get::<RequestId>()
                    .map(|id| id.0.clone())
                    .unwrap_or_default();
                let trace_id = req.extensions().get::<TraceId>().map(|id| id.0.clone());
                let remote_addr = req
                    .extensions()
                    .get::<ConnectInfo<SocketAddr>>()
                    .map(|ci| ci.0.to_string())
                    .unwrap_or_default();
                let user_agent = req
                    .headers()
                    .get(header::USER_AGENT)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);

                let response = next(req).await;

                let upstream = response
                    .extensions()
                    .get::<UpstreamName>()
                    .map(|u| u.0.clone())
                    .unwrap_or_default();
                let bytes_sent = response
                    .body()
                    .size_hint()
                    .exact()
                    .or_else(|| {
                        response
                            .headers()
                            .get(header::CONTENT_LENGTH)
                            .and_then(|v| v.to_str().ok())
                            .and_then(|v| v.parse().ok())
                    })
                    .unwrap_or(0);

                tracing::info!(
                    request_id = %request_id,
                    trace_id = trace_id.as_deref().unwrap_or(""),
                    method = %method,
                    path = %path,
                    host = %host,
                    status = response.status().as_u16(),
                    latency_ms = start.elapsed().as_millis() as u64,
                    bytes_sent,
                    remote_addr = %remote_addr,
                    upstream = %upstream,
                    user_agent = user_agent.as_deref().unwrap_or(""),
                    "request"
                );
                response
            })
        })
    }
}

/// Observes request count and latency into the Prometheus vectors. The route
/// label comes from the response extensions so it is always the matched
/// route's name, never a raw path.
pub struct MetricsMiddleware;

impl Middleware for MetricsMiddleware {
    fn wrap(&self, next: Handler) -> Handler {
        Arc::new(move |req: Request<Body>| {
            let next = Arc::clone(&next);
            Box::pin(async move {
                let start = Instant::now();
                let method = req.method().to_string();

                let response = next(req).await;

                let route = response
                    .extensions()
                    .get::<MatchedRoute>()
                    .map(|r| r.0.clone())
                    .unwrap_or_else(|| "unmatched".to_string());
                metrics::record_request(
                    &method,
                    &route,
                    response.status().as_u16(),
                    start.elapsed(),
                );
                response
            })
        })
    }
}

/// Gateway-wide admission by the sharded sliding-window limiter. Denials
/// answer 429 with `Retry-After: 60`.
pub struct RateLimitMiddleware {
    limiter: Arc<SlidingWindowLimiter>,
    key_func: RateLimitKey,
}

impl RateLimitMiddleware {
    pub fn new(limiter: Arc<SlidingWindowLimiter>, key_func: RateLimitKey) -> Self {
        Self { limiter, key_func }
    }

}

/// Rate limiting runs before authentication, so the consumer key is the
/// presented credential, falling back to the client IP.
fn rate_limit_key(req: &Request<Body>, key_func: RateLimitKey) -> String {
    let client_ip = || {
        req.extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ci| ci.0.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string())
    };

    match key_func {
        RateLimitKey::ClientIp => client_ip(),
        RateLimitKey::Consumer => req
            .headers()
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .unwrap_or_else(client_ip),
    }
}

impl Middleware for RateLimitMiddleware {
    fn wrap(&self, next: Handler) -> Handler {
        let limiter = Arc::clone(&self.limiter);
        let key_func = self.key_func;
        Arc::new(move |req: Request<Body>| {
            let next = Arc::clone(&next);
            let limiter = Arc::clone(&limiter);
            Box::pin(async move {
                let key = rate_limit_key(&req, key_func);
                if !limiter.allow(&key) {
                    metrics::record_rate_limit_hit(&key);
                    let mut response = json_response(
                        StatusCode::TOO_MANY_REQUESTS,
                        "rate_limit_exceeded",
                        "too many requests, please try again later",
                    );
                    response
                        .headers_mut()
                        .insert(header::RETRY_AFTER, HeaderValue::from_static("60"));
                    return response;
                }
                next(req).await
            })
        })
    }
}

/// Rejects unauthenticated requests with a JSON 401 and attaches the
/// identity of accepted ones to the request.
pub struct AuthMiddleware {
    authenticator: Arc<Authenticator>,
}

impl AuthMiddleware {
    pub fn new(authenticator: Arc<Authenticator>) -> Self {
        Self { authenticator }
    }
}

impl Middleware for AuthMiddleware {
    fn wrap(&self, next: Handler) -> Handler {
        let authenticator = Arc::clone(&self.authenticator);
        Arc::new(move |mut req: Request<Body>| {
            let next = Arc::clone(&next);
            let authenticator = Arc::clone(&authenticator);
            Box::pin(async move {
                match authenticator.authenticate(&req) {
                    Ok(identity) => {
                        req.extensions_mut().insert::<Identity>(identity);
                        next(req).await
                    }
                    Err(err) => {
                        metrics::record_auth_failure(&err.to_string());
                        json_response(StatusCode::UNAUTHORIZED, "unauthorized", &err.to_string())
                    }
                }
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, sync::Mutex, time::Duration};

    use super::*;
    use crate::core::auth::ApiKeyAuthenticator;

    fn terminal_ok() -> Handler {
        Arc::new(|_req| {
            Box::pin(async { plain_response(StatusCode::OK, "ok") })
        })
    }

    fn request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    /// Records pre/post markers so chain ordering is observable.
    struct Tracer {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Middleware for Tracer {
        fn wrap(&self, next: Handler) -> Handler {
            let name = self.name;
            let log = Arc::clone(&self.log);
            Arc::new(move |req| {
                let next = Arc::clone(&next);
                let log = Arc::clone(&log);
                Box::pin(async move {
                    log.lock().unwrap().push(format!("pre:{name}"));
                    let response = next(req).await;
                    log.lock().unwrap().push(format!("post:{name}"));
                    response
                })
            })
        }
    }

    #[tokio::test]
    async fn chain_runs_outermost_first() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let middlewares: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(Tracer {
                name: "a",
                log: Arc::clone(&log),
            }),
            Arc::new(Tracer {
                name: "b",
                log: Arc::clone(&log),
            }),
        ];

        let handler = chain(terminal_ok(), &middlewares);
        handler(request("/")).await;

        assert_eq!(
            *log.lock().unwrap(),
            vec!["pre:a", "pre:b", "post:b", "post:a"]
        );
    }

    #[tokio::test]
    async fn reversing_the_list_reverses_the_traces() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let middlewares: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(Tracer {
                name: "b",
                log: Arc::clone(&log),
            }),
            Arc::new(Tracer {
                name: "a",
                log: Arc::clone(&log),
            }),
        ];

        let handler = chain(terminal_ok(), &middlewares);
        handler(request("/")).await;

        assert_eq!(
            *log.lock().unwrap(),
            vec!["pre:b", "pre:a", "post:a", "post:b"]
        );
    }

    struct PanickingMiddleware;

    impl Middleware for PanickingMiddleware {
        fn wrap(&self, _next: Handler) -> Handler {
            Arc::new(|_req| Box::pin(async { panic!("middleware exploded") }))
        }
    }

    #[tokio::test]
    async fn middleware_panic_becomes_500() {
        let middlewares: Vec<Arc<dyn Middleware>> = vec![Arc::new(PanickingMiddleware)];
        let handler = chain(terminal_ok(), &middlewares);

        let response = handler(request("/boom")).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn terminal_panic_becomes_500() {
        let terminal: Handler = Arc::new(|_req| Box::pin(async { panic!("terminal exploded") }));
        let handler = chain(terminal, &[]);

        let response = handler(request("/boom")).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn request_id_is_preserved_or_minted() {
        let echo: Handler = Arc::new(|req| {
            Box::pin(async move {
                let id = req.extensions().get::<RequestId>().unwrap().0.clone();
                plain_response(StatusCode::OK, "ok").tap_id(&id)
            })
        });
        let middlewares: Vec<Arc<dyn Middleware>> = vec![Arc::new(RequestIdMiddleware)];
        let handler = chain(echo, &middlewares);

        let mut req = request("/");
        req.headers_mut()
            .insert("x-request-id", HeaderValue::from_static("req-42"));
        let response = handler(req).await;
        assert_eq!(response.headers().get("x-request-id").unwrap(), "req-42");
        assert_eq!(response.headers().get("x-seen-id").unwrap(), "req-42");

        let response = handler(request("/")).await;
        let minted = response
            .headers()
            .get("x-request-id")
            .unwrap()
            .to_str()
            .unwrap();
        assert!(Uuid::parse_str(minted).is_ok());
    }

    trait TapId {
        fn tap_id(self, id: &str) -> Self;
    }

    impl TapId for Response<Body> {
        fn tap_id(mut self, id: &str) -> Self {
            if let Ok(v) = HeaderValue::from_str(id) {
                self.headers_mut().insert("x-seen-id", v);
            }
            self
        }
    }

    #[tokio::test]
    async fn traceparent_is_preserved_or_minted() {
        let capture: Handler = Arc::new(|req| {
            Box::pin(async move {
                let trace = req.extensions().get::<TraceId>().unwrap().0.clone();
                plain_response(StatusCode::OK, "ok").tap_id(&trace)
            })
        });
        let middlewares: Vec<Arc<dyn Middleware>> = vec![Arc::new(TraceContextMiddleware)];
        let handler = chain(capture, &middlewares);

        let mut req = request("/");
        req.headers_mut().insert(
            "traceparent",
            HeaderValue::from_static("00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01"),
        );
        let response = handler(req).await;
        assert_eq!(
            response.headers().get("x-seen-id").unwrap(),
            "0af7651916cd43dd8448eb211c80319c"
        );

        let response = handler(request("/")).await;
        let minted = response.headers().get("x-seen-id").unwrap().to_str().unwrap();
        assert_eq!(minted.len(), 32);
    }

    #[tokio::test]
    async fn rate_limit_denial_is_429_with_retry_after() {
        let limiter = Arc::new(SlidingWindowLimiter::new(2, Duration::from_secs(60)));
        let middlewares: Vec<Arc<dyn Middleware>> = vec![Arc::new(RateLimitMiddleware::new(
            limiter,
            RateLimitKey::ClientIp,
        ))];
        let handler = chain(terminal_ok(), &middlewares);

        let addr: SocketAddr = "192.0.2.1:1234".parse().unwrap();
        let make_req = || {
            let mut req = request("/");
            req.extensions_mut().insert(ConnectInfo(addr));
            req
        };

        assert_eq!(handler(make_req()).await.status(), StatusCode::OK);
        assert_eq!(handler(make_req()).await.status(), StatusCode::OK);

        let denied = handler(make_req()).await;
        assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(denied.headers().get(header::RETRY_AFTER).unwrap(), "60");
        assert_eq!(
            denied.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }

    #[tokio::test]
    async fn auth_failure_is_401_with_json_body() {
        let mut keys = HashMap::new();
        keys.insert("k1".to_string(), "consumer-a".to_string());
        let authenticator = Arc::new(Authenticator::ApiKey(ApiKeyAuthenticator::new(keys)));
        let capture: Handler = Arc::new(|req| {
            Box::pin(async move {
                let subject = req
                    .extensions()
                    .get::<Identity>()
                    .map(|i| i.subject.clone())
                    .unwrap_or_default();
                plain_response(StatusCode::OK, "ok").tap_id(&subject)
            })
        });
        let middlewares: Vec<Arc<dyn Middleware>> =
            vec![Arc::new(AuthMiddleware::new(authenticator))];
        let handler = chain(capture, &middlewares);

        let denied = handler(request("/")).await;
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            denied.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );

        let mut req = request("/");
        req.headers_mut()
            .insert("x-api-key", HeaderValue::from_static("k1"));
        let allowed = handler(req).await;
        assert_eq!(allowed.status(), StatusCode::OK);
        assert_eq!(allowed.headers().get("x-seen-id").unwrap(), "consumer-a");
    }
}
