//! Configuration data structures for Nexus.
//!
//! These types map directly to YAML (also JSON / TOML) configuration files.
//! They are intentionally serde-friendly and include defaults so that minimal
//! configs remain concise. Two route dialects are accepted: the classic
//! `routes` + `upstreams` form and the richer `routes_v2` + `clusters` DSL;
//! both compile into the same snapshot.
use std::{collections::HashMap, time::Duration};

use serde::{Deserialize, Serialize};

/// Top-level gateway configuration.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub upstreams: Vec<Upstream>,
    pub routes: Vec<Route>,
    pub clusters: Vec<Cluster>,
    pub routes_v2: Vec<RouteV2>,
    pub rate_limit: RateLimitConfig,
    pub auth: AuthConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub metrics: MetricsConfig,
    pub admin: AdminConfig,
}

/// HTTP server settings.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    /// Cleartext listen address.
    pub listen: String,
    #[serde(with = "humantime_serde")]
    pub read_timeout: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub write_timeout: Option<Duration>,
    /// Upper bound on draining in-flight requests at shutdown.
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    pub tls: Option<TlsConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            read_timeout: None,
            write_timeout: None,
            shutdown_timeout: Duration::from_secs(30),
            tls: None,
        }
    }
}

/// Inbound TLS settings (TLS 1.2+).
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub cert_file: String,
    pub key_file: String,
    /// Minimum protocol version, "1.2" or "1.3".
    pub min_version: String,
    /// TLS listen address.
    pub listen: String,
    pub auto_reload: bool,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cert_file: String::new(),
            key_file: String::new(),
            min_version: "1.2".to_string(),
            listen: "0.0.0.0:8443".to_string(),
            auto_reload: false,
        }
    }
}

/// Classic upstream group: a named list of HTTP targets.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Upstream {
    pub name: String,
    pub algorithm: Option<LoadBalancerKind>,
    pub targets: Vec<Target>,
    pub health_check: Option<HealthCheckConfig>,
}

/// A single backend address within a classic upstream.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Target {
    pub address: String,
    pub weight: u32,
}

/// Active health probe settings for a cluster.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HealthCheckConfig {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub path: String,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(2),
            path: "/healthz".to_string(),
        }
    }
}

/// Classic route: host + ordered path rules → upstream, with an optional
/// rewrite.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Route {
    pub name: String,
    /// Exact host to match; empty matches any host.
    pub host: String,
    pub paths: Vec<PathRule>,
    pub upstream: String,
    pub rewrite: Option<RewriteRule>,
    pub filters: Vec<RouteFilter>,
}

/// One path matching rule within a route.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PathRule {
    pub path: String,
    #[serde(rename = "type")]
    pub match_type: MatchType,
    /// Restrict to these methods; absent means all.
    #[serde(default)]
    pub methods: Option<Vec<String>>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Exact,
    Prefix,
}

/// Backend protocol selector shared by clusters and rewrites.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    #[default]
    Http,
    Grpc,
    Dubbo,
}

/// Request rewriting rules for a classic route.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct RewriteRule {
    pub protocol: Protocol,
    pub path_rewrite: Option<PathRewrite>,
    pub headers: Option<HeaderRewrite>,
    pub grpc: Option<GrpcRewrite>,
    pub dubbo: Option<DubboRewrite>,
}

/// Path prefix replacement: the matched route prefix is replaced with
/// `prefix`. An empty prefix is a no-op.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct PathRewrite {
    pub prefix: String,
}

/// Header manipulation, applied in Add → Set → Remove order.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct HeaderRewrite {
    pub add: HashMap<String, String>,
    pub set: HashMap<String, String>,
    pub remove: Vec<String>,
}

/// gRPC target for a rewrite, e.g. service "helloworld.Greeter" method
/// "SayHello".
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct GrpcRewrite {
    pub service: String,
    pub method: String,
}

/// Dubbo target for a rewrite.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct DubboRewrite {
    pub service: String,
    pub method: String,
    pub group: String,
    pub version: String,
}

/// Protocol-tagged upstream cluster.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Cluster {
    pub name: String,
    #[serde(rename = "type")]
    pub protocol: Protocol,
    pub endpoints: Vec<ClusterEndpoint>,
    pub lb: LoadBalancerKind,
    pub keepalive: Option<KeepaliveConfig>,
    pub grpc: Option<ClusterGrpc>,
    pub dubbo: Option<ClusterDubbo>,
    pub health_check: Option<HealthCheckConfig>,
}

/// One addressable backend instance. At least one of the fields must be
/// non-empty; `url` for HTTP, `target` for gRPC resolver strings, `addr` for
/// Dubbo host:port.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct ClusterEndpoint {
    pub url: String,
    pub target: String,
    pub addr: String,
}

impl ClusterEndpoint {
    /// The effective address: url, then target, then addr.
    pub fn address(&self) -> &str {
        if !self.url.is_empty() {
            &self.url
        } else if !self.target.is_empty() {
            &self.target
        } else {
            &self.addr
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancerKind {
    #[default]
    RoundRobin,
    Random,
    PickFirst,
}

/// Connection keepalive tuning for a cluster.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct KeepaliveConfig {
    pub max_idle_conns: usize,
    pub idle_conn_timeout_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct ClusterGrpc {
    /// Overrides the outbound Host/:authority.
    pub authority: String,
    /// Bound on the inbound body collected for framing, in MiB.
    pub max_recv_msg_mb: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct ClusterDubbo {
    pub application: String,
    pub group: String,
    pub version: String,
    pub serialization: String,
}

/// Route in the v2 DSL: declarative match + filter pipeline + upstream ref.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct RouteV2 {
    pub name: String,
    #[serde(rename = "match")]
    pub matcher: RouteMatch,
    pub filters: Vec<RouteFilter>,
    pub upstream: RouteUpstream,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct RouteMatch {
    pub methods: Vec<String>,
    pub path: String,
    pub path_prefix: String,
    pub headers: Vec<HeaderMatch>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct HeaderMatch {
    pub name: String,
    pub exact: String,
    pub contains: String,
}

/// Declarative filter reference compiled at snapshot build time.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct RouteFilter {
    #[serde(rename = "type")]
    pub filter_type: String,
    pub args: HashMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct RouteUpstream {
    pub cluster: String,
    pub timeout_ms: Option<u64>,
    pub grpc: Option<RouteUpstreamGrpc>,
    pub dubbo: Option<RouteUpstreamDubbo>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct RouteUpstreamGrpc {
    pub service: String,
    pub method: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct RouteUpstreamDubbo {
    pub interface: String,
    pub method: String,
    pub param_types: Vec<String>,
}

/// Gateway-wide sliding-window rate limiting.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub rate: u64,
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    pub key_func: RateLimitKey,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            rate: 100,
            window: Duration::from_secs(60),
            key_func: RateLimitKey::ClientIp,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitKey {
    #[default]
    ClientIp,
    Consumer,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AuthConfig {
    pub api_key: ApiKeyConfig,
}

/// API-key authentication: a static key → consumer-name mapping.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct ApiKeyConfig {
    pub enabled: bool,
    pub keys: HashMap<String, String>,
}

/// Per-cluster circuit breaking thresholds.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "/metrics".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AdminConfig {
    pub enabled: bool,
    pub listen: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: "127.0.0.1:9090".to_string(),
        }
    }
}
