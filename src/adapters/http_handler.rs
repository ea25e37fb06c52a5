//! The terminal gateway handler.
//!
//! Innermost element of the middleware chain: loads the current snapshot with
//! one atomic pointer read, matches the route, applies compiled filters,
//! checks circuit-breaker admission, selects a healthy endpoint, rewrites the
//! request for the upstream's protocol, and forwards it through the shared
//! streaming proxy engine. Upstream outcomes feed back into the breaker and
//! the passive health flags.
use std::{net::SocketAddr, sync::Arc, time::Instant};

use axum::{body::Body, extract::ConnectInfo};
use http::{HeaderValue, Request, Response, StatusCode, Uri, header};
use thiserror::Error;
use tracing::Instrument;

use crate::{
    adapters::{
        middleware::{Handler, MatchedRoute, RequestId, UpstreamName},
        rewrite::{
            self, DEFAULT_MAX_TRANSCODE_BYTES, RewriteError, apply_dubbo_rewrite,
            apply_grpc_rewrite,
        },
    },
    config::models::Protocol,
    core::{
        cluster::{CompiledCluster, CompiledEndpoint, SelectError},
        snapshot::{CompiledRoute, Snapshot, SnapshotStore},
    },
    metrics,
    ports::http_client::{HttpClient, HttpClientError},
    tracing_setup,
};

#[derive(Debug, Error)]
enum GatewayError {
    #[error("gateway not configured")]
    NotConfigured,
    #[error("no matching route")]
    NoMatch,
    #[error("filter error")]
    Filter,
    #[error("upstream not available")]
    UnknownCluster,
    #[error("upstream circuit open")]
    CircuitOpen,
    #[error("no healthy upstream endpoints")]
    NoHealthy,
    #[error("request rewrite failed")]
    Rewrite(#[from] RewriteError),
    #[error("invalid upstream target")]
    BadTarget,
    #[error("bad gateway")]
    Transport,
    #[error("upstream timeout")]
    Timeout,
}

impl GatewayError {
    fn status(&self) -> StatusCode {
        match self {
            GatewayError::NotConfigured => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::NoMatch => StatusCode::NOT_FOUND,
            GatewayError::Filter | GatewayError::Rewrite(_) => StatusCode::BAD_REQUEST,
            GatewayError::UnknownCluster | GatewayError::BadTarget | GatewayError::Transport => {
                StatusCode::BAD_GATEWAY
            }
            GatewayError::CircuitOpen | GatewayError::NoHealthy => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}

/// Terminal handler owning the snapshot store handle and the proxy engine.
pub struct GatewayHandler {
    store: Arc<SnapshotStore>,
    client: Arc<dyn HttpClient>,
}

impl GatewayHandler {
    pub fn new(store: Arc<SnapshotStore>, client: Arc<dyn HttpClient>) -> Self {
        Self { store, client }
    }

    /// Adapt this handler into the middleware chain's terminal `Handler`.
    pub fn into_handler(self: Arc<Self>) -> Handler {
        Arc::new(move |req| {
            let this = Arc::clone(&self);
            Box::pin(async move { this.handle(req).await })
        })
    }

    /// Process one request against the snapshot captured at entry. The whole
    /// dispatch runs inside a request span so upstream logs correlate with
    /// the id assigned at the top of the chain.
    pub async fn handle(&self, req: Request<Body>) -> Response<Body> {
        let request_id = req
            .extensions()
            .get::<RequestId>()
            .map(|id| id.0.clone())
            .unwrap_or_default();
        let span =
            tracing_setup::create_request_span(req.method().as_str(), req.uri().path(), &request_id);

        let start = Instant::now();
        let response = self.dispatch(req).instrument(span.clone()).await;
        span.record("http.status_code", response.status().as_u16());
        span.record("duration_ms", start.elapsed().as_millis() as u64);
        response
    }

    async fn dispatch(&self, req: Request<Body>) -> Response<Body> {
        let snapshot = match self.store.load() {
            Some(snapshot) => snapshot,
            None => return error_response(&GatewayError::NotConfigured, None, None),
        };

        let method = req.method().as_str().to_string();
        let host = inbound_host(&req);
        let path = req.uri().path().to_string();

        let route = match snapshot.router.find(&method, &host, &path, req.headers()) {
            Some(route) => route,
            None => {
                tracing::debug!(%method, %host, %path, "no matching route");
                return error_response(&GatewayError::NoMatch, None, None);
            }
        };

        let labels = (
            MatchedRoute(route.name.clone()),
            UpstreamName(route.cluster_name.clone()),
        );

        match self.forward(req, &snapshot, &route, &host, &path).await {
            Ok(mut response) => {
                response.extensions_mut().insert(labels.0);
                response.extensions_mut().insert(labels.1);
                response
            }
            Err(e) => {
                let level_error = matches!(
                    e,
                    GatewayError::UnknownCluster
                        | GatewayError::Transport
                        | GatewayError::Timeout
                        | GatewayError::NoHealthy
                        | GatewayError::BadTarget
                );
                if level_error {
                    tracing::error!(
                        route = %route.name,
                        cluster = %route.cluster_name,
                        error = %e,
                        "upstream dispatch error"
                    );
                } else {
                    tracing::info!(route = %route.name, error = %e, "request rejected");
                }
                error_response(&e, Some(labels.0), Some(labels.1))
            }
        }
    }

    async fn forward(
        &self,
        mut req: Request<Body>,
        snapshot: &Snapshot,
        route: &CompiledRoute,
        host: &str,
        path: &str,
    ) -> Result<Response<Body>, GatewayError> {
        // Compiled filters run before any protocol-specific rewriting.
        for filter in &route.filters {
            filter.apply(&mut req).map_err(|e| {
                tracing::warn!(route = %route.name, error = %e, "filter failed");
                GatewayError::Filter
            })?;
        }

        let cluster = snapshot
            .cluster(&route.cluster_name)
            .ok_or(GatewayError::UnknownCluster)?;

        let breaker = cluster.breaker.clone();
        if let Some(b) = &breaker {
            if !b.allow() {
                return Err(GatewayError::CircuitOpen);
            }
        }

        let endpoint = cluster.next_endpoint().map_err(|e| match e {
            SelectError::NoHealthy => GatewayError::NoHealthy,
        })?;

        append_forwarded_for(&mut req);

        let outbound = self
            .build_outbound(req, route, cluster, &endpoint, host, path)
            .await?;

        let result = match route.timeout {
            Some(limit) => match tokio::time::timeout(limit, self.client.send_request(outbound))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(HttpClientError::Timeout(limit)),
            },
            None => self.client.send_request(outbound).await,
        };

        match result {
            Ok(response) => {
                // Success/failure attribution: any response below 500 counts
                // as success; 5xx counts against the breaker.
                if let Some(b) = &breaker {
                    if response.status().as_u16() < 500 {
                        b.record_success();
                    } else {
                        b.record_failure();
                    }
                }
                Ok(response)
            }
            Err(err) => {
                if let Some(b) = &breaker {
                    b.record_failure();
                }
                // Transport-level failures flip the passive health flag; the
                // active prober owns recovery.
                match err {
                    HttpClientError::ConnectionError(_) => {
                        endpoint.set_healthy(false);
                        metrics::set_upstream_healthy(&cluster.name, endpoint.address(), false);
                        Err(GatewayError::Transport)
                    }
                    HttpClientError::Timeout(_) => Err(GatewayError::Timeout),
                    HttpClientError::InvalidRequest(reason) => {
                        tracing::error!(%reason, "invalid outbound request");
                        Err(GatewayError::Transport)
                    }
                }
            }
        }
    }

    /// Produce the outbound request for the upstream's wire protocol, with
    /// the target endpoint injected into the URI.
    async fn build_outbound(
        &self,
        mut req: Request<Body>,
        route: &CompiledRoute,
        cluster: &CompiledCluster,
        endpoint: &CompiledEndpoint,
        host: &str,
        path: &str,
    ) -> Result<Request<Body>, GatewayError> {
        let matched_path = route.matched_path(path).unwrap_or("");

        match route.wire {
            Protocol::Http => {
                if let Some(rw) = &route.rewrite {
                    rewrite::apply_http_rewrite(&mut req, rw, matched_path)?;
                }
                // Many backends route on the original Host.
                if let Ok(value) = HeaderValue::from_str(host) {
                    req.headers_mut().insert(header::HOST, value);
                }
                retarget(&mut req, endpoint.address())?;
                Ok(req)
            }
            Protocol::Grpc => {
                let target = route.grpc.as_ref().ok_or(GatewayError::BadTarget)?;
                let max_bytes = cluster
                    .grpc
                    .as_ref()
                    .filter(|g| g.max_recv_msg_mb > 0)
                    .map(|g| (g.max_recv_msg_mb as usize) * 1024 * 1024)
                    .unwrap_or(DEFAULT_MAX_TRANSCODE_BYTES);

                let mut out = apply_grpc_rewrite(req, target, max_bytes).await?;
                if let Some(headers) = route.rewrite.as_ref().and_then(|rw| rw.headers.as_ref()) {
                    rewrite::apply_header_rewrite(&mut out, headers);
                }
                if let Some(authority) = cluster
                    .grpc
                    .as_ref()
                    .map(|g| g.authority.as_str())
                    .filter(|a| !a.is_empty())
                {
                    if let Ok(value) = HeaderValue::from_str(authority) {
                        out.headers_mut().insert(header::HOST, value);
                    }
                }
                retarget(&mut out, endpoint.address())?;
                Ok(out)
            }
            Protocol::Dubbo => {
                let target = route.dubbo.as_ref().ok_or(GatewayError::BadTarget)?;
                let mut out =
                    apply_dubbo_rewrite(req, target, DEFAULT_MAX_TRANSCODE_BYTES).await?;
                if let Some(headers) = route.rewrite.as_ref().and_then(|rw| rw.headers.as_ref()) {
                    rewrite::apply_header_rewrite(&mut out, headers);
                }
                retarget(&mut out, endpoint.address())?;
                Ok(out)
            }
        }
    }
}

/// Point the request at `address`, keeping the (possibly rewritten) path and
/// query. Addresses without a scheme default to http.
fn retarget(req: &mut Request<Body>, address: &str) -> Result<(), GatewayError> {
    let (scheme, authority) = match address.split_once("://") {
        Some((scheme, rest)) => {
            let authority = rest.split('/').next().unwrap_or(rest);
            (scheme.to_string(), authority.to_string())
        }
        None => ("http".to_string(), address.to_string()),
    };

    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let uri = Uri::builder()
        .scheme(scheme.as_str())
        .authority(authority.as_str())
        .path_and_query(path_and_query)
        .build()
        .map_err(|e| {
            tracing::error!(%address, error = %e, "invalid upstream target");
            GatewayError::BadTarget
        })?;
    *req.uri_mut() = uri;
    Ok(())
}

/// The Host the client addressed, from the Host header or the request URI.
fn inbound_host(req: &Request<Body>) -> String {
    req.headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.to_string()))
        .unwrap_or_default()
}

fn append_forwarded_for(req: &mut Request<Body>) {
    let client_ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip().to_string());
    if let Some(ip) = client_ip {
        let value = match req
            .headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
        {
            Some(existing) => format!("{existing}, {ip}"),
            None => ip,
        };
        if let Ok(v) = HeaderValue::from_str(&value) {
            req.headers_mut().insert("x-forwarded-for", v);
        }
    }
}

fn error_response(
    err: &GatewayError,
    route: Option<MatchedRoute>,
    upstream: Option<UpstreamName>,
) -> Response<Body> {
    let mut response = Response::builder()
        .status(err.status())
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from(err.to_string()))
        .unwrap_or_else(|_| Response::new(Body::from("gateway error")));
    if let Some(route) = route {
        response.extensions_mut().insert(route);
    }
    if let Some(upstream) = upstream {
        response.extensions_mut().insert(upstream);
    }
    response
}

#[cfg(test)]
mod tests {
    use std::{
        sync::Mutex,
        time::Duration as StdDuration,
    };

    use async_trait::async_trait;
    use http_body_util::BodyExt;

    use super::*;
    use crate::{
        config::models::{
            Cluster, ClusterEndpoint, Config, MatchType, PathRule, Route,
        },
        core::compiler,
        ports::http_client::HttpClientResult,
    };

    /// Captures forwarded requests and plays back canned responses.
    struct MockClient {
        requests: Mutex<Vec<(String, String)>>, // (uri, host header)
        responses: Mutex<Vec<Result<u16, HttpClientError>>>,
    }

    impl MockClient {
        fn returning(responses: Vec<Result<u16, HttpClientError>>) -> Arc<Self> {
            Arc::new(Self {
                requests: Mutex::new(Vec::new()),
                responses: Mutex::new(responses),
            })
        }

        fn seen(&self) -> Vec<(String, String)> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl HttpClient for MockClient {
        async fn send_request(&self, req: Request<Body>) -> HttpClientResult<Response<Body>> {
            let host = req
                .headers()
                .get(header::HOST)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            self.requests
                .lock()
                .unwrap()
                .push((req.uri().to_string(), host));

            let mut responses = self.responses.lock().unwrap();
            match responses.pop() {
                Some(Ok(status)) => Ok(Response::builder()
                    .status(status)
                    .body(Body::from("upstream body"))
                    .unwrap()),
                Some(Err(e)) => Err(e),
                None => Ok(Response::new(Body::from("upstream body"))),
            }
        }

        async fn health_check(
            &self,
            _url: &str,
            _timeout: StdDuration,
        ) -> HttpClientResult<bool> {
            Ok(true)
        }
    }

    fn config_with_route() -> Config {
        let mut cfg = Config::default();
        cfg.clusters.push(Cluster {
            name: "cluster-a".to_string(),
            endpoints: vec![ClusterEndpoint {
                url: "http://127.0.0.1:9001".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        });
        cfg.routes.push(Route {
            name: "exact-v1".to_string(),
            host: "api.example.com".to_string(),
            paths: vec![PathRule {
                path: "/v1/x".to_string(),
                match_type: MatchType::Exact,
                methods: None,
            }],
            upstream: "cluster-a".to_string(),
            ..Default::default()
        });
        cfg
    }

    fn handler_for(cfg: &Config, client: Arc<MockClient>) -> GatewayHandler {
        let store = Arc::new(SnapshotStore::new());
        let snapshot = compiler::compile(cfg, None, 1).unwrap();
        store.store(Arc::new(snapshot));
        GatewayHandler::new(store, client)
    }

    fn inbound(method: &str, host: &str, path: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(path)
            .header(header::HOST, host)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn exact_route_hit_forwards_verbatim() {
        let client = MockClient::returning(vec![Ok(200)]);
        let handler = handler_for(&config_with_route(), Arc::clone(&client));

        let response = handler
            .handle(inbound("GET", "api.example.com:8080", "/v1/x"))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.extensions().get::<MatchedRoute>().unwrap().0,
            "exact-v1"
        );

        let seen = client.seen();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "http://127.0.0.1:9001/v1/x");
        // The outbound Host keeps the inbound host.
        assert_eq!(seen[0].1, "api.example.com:8080");

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"upstream body");
    }

    #[tokio::test]
    async fn unmatched_request_is_404() {
        let client = MockClient::returning(vec![]);
        let handler = handler_for(&config_with_route(), client);

        let response = handler.handle(inbound("GET", "h", "/nope")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn empty_store_is_503() {
        let store = Arc::new(SnapshotStore::new());
        let handler = GatewayHandler::new(store, MockClient::returning(vec![]));

        let response = handler.handle(inbound("GET", "h", "/v1/x")).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn transport_failure_is_502_and_marks_endpoint() {
        let client = MockClient::returning(vec![Err(HttpClientError::ConnectionError(
            "refused".to_string(),
        ))]);
        let cfg = config_with_route();
        let handler = handler_for(&cfg, client);

        let response = handler
            .handle(inbound("GET", "api.example.com", "/v1/x"))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        // The endpoint was flagged unhealthy, so the retry finds nothing.
        let response = handler
            .handle(inbound("GET", "api.example.com", "/v1/x"))
            .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn breaker_opens_after_failures_and_admits_after_timeout() {
        // Responses pop from the back: 502, 500, timeout, 200.
        let client = MockClient::returning(vec![
            Ok(200),
            Err(HttpClientError::Timeout(StdDuration::from_millis(10))),
            Ok(500),
            Ok(502),
        ]);
        let mut cfg = config_with_route();
        cfg.circuit_breaker.enabled = true;
        cfg.circuit_breaker.failure_threshold = 2;
        cfg.circuit_breaker.success_threshold = 1;
        cfg.circuit_breaker.timeout = StdDuration::from_millis(50);
        let handler = handler_for(&cfg, client);

        // Two upstream 5xx responses trip the breaker.
        let r1 = handler.handle(inbound("GET", "api.example.com", "/v1/x")).await;
        assert_eq!(r1.status(), StatusCode::BAD_GATEWAY);
        let r2 = handler.handle(inbound("GET", "api.example.com", "/v1/x")).await;
        assert_eq!(r2.status(), StatusCode::INTERNAL_SERVER_ERROR);

        // Open: fast-fail without dialing.
        let r3 = handler.handle(inbound("GET", "api.example.com", "/v1/x")).await;
        assert_eq!(r3.status(), StatusCode::SERVICE_UNAVAILABLE);

        // After the open timeout the half-open probe goes through; its
        // success closes the breaker again.
        tokio::time::sleep(StdDuration::from_millis(60)).await;
        let r4 = handler.handle(inbound("GET", "api.example.com", "/v1/x")).await;
        assert_eq!(r4.status(), StatusCode::GATEWAY_TIMEOUT);
        // Timeout counted as failure; breaker reopened.
        let r5 = handler.handle(inbound("GET", "api.example.com", "/v1/x")).await;
        assert_eq!(r5.status(), StatusCode::SERVICE_UNAVAILABLE);

        tokio::time::sleep(StdDuration::from_millis(60)).await;
        let r6 = handler.handle(inbound("GET", "api.example.com", "/v1/x")).await;
        assert_eq!(r6.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn strip_prefix_filter_applies_before_forwarding() {
        let mut cfg = Config::default();
        cfg.clusters.push(Cluster {
            name: "cluster-a".to_string(),
            endpoints: vec![ClusterEndpoint {
                url: "http://127.0.0.1:9001".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        });
        let mut args = std::collections::HashMap::new();
        args.insert("prefix".to_string(), "/api".to_string());
        cfg.routes.push(Route {
            name: "stripped".to_string(),
            paths: vec![PathRule {
                path: "/api".to_string(),
                match_type: MatchType::Prefix,
                methods: None,
            }],
            upstream: "cluster-a".to_string(),
            filters: vec![crate::config::models::RouteFilter {
                filter_type: "strip_prefix".to_string(),
                args,
            }],
            ..Default::default()
        });

        let client = MockClient::returning(vec![Ok(200)]);
        let handler = handler_for(&cfg, Arc::clone(&client));

        handler.handle(inbound("GET", "h", "/api/users")).await;
        assert_eq!(client.seen()[0].0, "http://127.0.0.1:9001/users");
    }
}
