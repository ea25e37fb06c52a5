//! The streaming reverse-proxy engine.
//!
//! One long-lived engine serves the whole gateway; the target URL is injected
//! per request by the protocol adapter, never by allocating a fresh client.
//! Two hyper clients back it: an ALPN-capable HTTP/1.1 + TLS client for
//! ordinary traffic, and an HTTP/2 prior-knowledge (h2c) client for gRPC
//! upstreams. Response bodies stream back without full-body buffering.
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use eyre::Result;
use hyper::{Request, Response, Version, header, header::HeaderValue};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use rustls_native_certs::load_native_certs;
use tokio::time::timeout;

use crate::ports::http_client::{HttpClient, HttpClientError, HttpClientResult};

/// Transport tuning, from global or cluster config.
#[derive(Debug, Clone)]
pub struct ProxyEngineOptions {
    /// Idle connections kept per host.
    pub max_idle_per_host: usize,
    /// How long an idle pooled connection survives.
    pub idle_timeout: Duration,
    /// Dial timeout for new connections.
    pub connect_timeout: Duration,
}

impl Default for ProxyEngineOptions {
    fn default() -> Self {
        Self {
            max_idle_per_host: 100,
            idle_timeout: Duration::from_secs(90),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Reverse-proxy engine over pooled Hyper clients with Rustls.
pub struct ProxyEngine {
    https: Client<HttpsConnector<HttpConnector>, Body>,
    h2c: Client<HttpConnector, Body>,
}

impl ProxyEngine {
    pub fn new(opts: ProxyEngineOptions) -> Result<Self> {
        // Install default crypto provider for rustls if not already set
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false); // Allow HTTPS URLs
        http_connector.set_connect_timeout(Some(opts.connect_timeout));

        let mut root_cert_store = rustls::RootCertStore::empty();
        let native_certs = load_native_certs();
        for cert in native_certs.certs {
            if root_cert_store.add(cert).is_err() {
                tracing::warn!("Failed to add native certificate to rustls RootCertStore");
            }
        }
        if !native_certs.errors.is_empty() {
            tracing::warn!(
                "Some native certificates failed to load: {:?}",
                native_certs.errors
            );
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();

        let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector);

        let https = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(opts.max_idle_per_host)
            .pool_idle_timeout(opts.idle_timeout)
            .build::<_, Body>(https_connector);

        // gRPC upstreams speak cleartext HTTP/2 with prior knowledge.
        let mut h2c_connector = HttpConnector::new();
        h2c_connector.set_connect_timeout(Some(opts.connect_timeout));
        let h2c = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(opts.max_idle_per_host)
            .pool_idle_timeout(opts.idle_timeout)
            .http2_only(true)
            .build::<_, Body>(h2c_connector);

        Ok(Self { https, h2c })
    }

    /// Pick the client by the request's wire version: HTTP/2 requests (gRPC)
    /// go through the h2c client, everything else through the pooled
    /// HTTP/1.1 + TLS client.
    fn is_h2(req: &Request<Body>) -> bool {
        req.version() == Version::HTTP_2
    }
}

impl Default for ProxyEngine {
    fn default() -> Self {
        Self::new(ProxyEngineOptions::default()).expect("Failed to create proxy engine")
    }
}

#[async_trait]
impl HttpClient for ProxyEngine {
    async fn send_request(&self, mut req: Request<Body>) -> HttpClientResult<Response<Body>> {
        // The protocol adapter sets Host deliberately (inbound host for
        // HTTP, authority for gRPC); only fill it in when absent.
        if !req.headers().contains_key(header::HOST) {
            let host_value = req.uri().authority().map(|a| a.to_string());
            match host_value.and_then(|h| HeaderValue::from_str(&h).ok()) {
                Some(v) => {
                    req.headers_mut().insert(header::HOST, v);
                }
                None => {
                    return Err(HttpClientError::InvalidRequest(
                        "outgoing URI has no host".to_string(),
                    ));
                }
            }
        }

        let method = req.method().clone();
        let uri = req.uri().clone();
        let target = format!(
            "{}://{}",
            uri.scheme_str().unwrap_or("http"),
            uri.authority().map_or_else(String::new, |a| a.to_string())
        );

        let result = if Self::is_h2(&req) {
            // Over h2 the Host header becomes the :authority pseudo-header,
            // which is how the gRPC authority override reaches the upstream.
            self.h2c.request(req).await
        } else {
            let (mut parts, body) = req.into_parts();
            parts.version = Version::HTTP_11;
            self.https.request(Request::from_parts(parts, body)).await
        };

        match result {
            Ok(response) => {
                let (mut parts, incoming) = response.into_parts();
                // The framing toward the client is re-done by the server;
                // drop the upstream's transfer encoding.
                parts.headers.remove(header::TRANSFER_ENCODING);
                Ok(Response::from_parts(parts, Body::new(incoming)))
            }
            Err(e) => {
                tracing::error!(
                    target = %target,
                    method = %method,
                    uri = %uri,
                    error = %e,
                    "upstream request failed"
                );
                Err(HttpClientError::ConnectionError(e.to_string()))
            }
        }
    }

    async fn health_check(&self, url: &str, probe_timeout: Duration) -> HttpClientResult<bool> {
        let request = Request::builder()
            .method("GET")
            .uri(url)
            .body(Body::empty())
            .map_err(|e| HttpClientError::InvalidRequest(e.to_string()))?;

        match timeout(probe_timeout, self.send_request(request)).await {
            Ok(Ok(response)) => {
                let healthy = response.status().is_success() || response.status().is_redirection();
                Ok(healthy)
            }
            Ok(Err(err)) => {
                tracing::debug!(url, error = %err, "health probe error");
                Ok(false)
            }
            Err(_) => Err(HttpClientError::Timeout(probe_timeout)),
        }
    }
}
