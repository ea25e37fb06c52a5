//! Compiled snapshots and the route index.
//!
//! A `Snapshot` is the immutable bundle the data plane consults for every
//! request: the route index, the compiled clusters, and a monotonically
//! increasing version. Snapshots are published through `SnapshotStore` with a
//! single atomic pointer store; readers take one atomic load per request and
//! keep the pointer stable for the request's lifetime. Producers never mutate
//! a published snapshot.
use std::{collections::HashMap, sync::Arc, time::Duration};

use arc_swap::ArcSwapOption;
use http::HeaderMap;

use crate::{
    config::models::{HeaderMatch, MatchType, Protocol, RewriteRule},
    core::{cluster::CompiledCluster, filter::Filter},
};

/// Normalized gRPC destination resolved at compile time.
#[derive(Debug, Clone)]
pub struct GrpcTarget {
    pub service: String,
    pub method: String,
}

/// Normalized Dubbo destination resolved at compile time. Group and version
/// are merged from the route rewrite and the cluster configuration.
#[derive(Debug, Clone)]
pub struct DubboTarget {
    pub interface: String,
    pub method: String,
    pub param_types: Vec<String>,
    pub group: String,
    pub version: String,
}

/// One path rule carried into the compiled route, used both for matching and
/// for determining the matched prefix during path rewriting.
#[derive(Debug, Clone)]
pub struct CompiledPathRule {
    pub path: String,
    pub match_type: MatchType,
    pub methods: Option<Vec<String>>,
}

impl CompiledPathRule {
    fn allows_method(&self, method: &str) -> bool {
        match &self.methods {
            Some(methods) => methods.iter().any(|m| m == method),
            None => true,
        }
    }
}

/// A fully compiled route: match criteria plus everything the protocol
/// adapter needs, with by-name references already resolved.
#[derive(Debug)]
pub struct CompiledRoute {
    pub name: String,
    /// Exact host to match after port stripping; empty matches any host.
    pub host: String,
    pub path_rules: Vec<CompiledPathRule>,
    pub header_matches: Vec<HeaderMatch>,
    pub filters: Vec<Filter>,
    /// HTTP-level rewrite (path prefix + header operations).
    pub rewrite: Option<RewriteRule>,
    /// Wire protocol toward the upstream, resolved from the cluster type and
    /// any protocol-tagged rewrite.
    pub wire: Protocol,
    pub grpc: Option<GrpcTarget>,
    pub dubbo: Option<DubboTarget>,
    pub cluster_name: String,
    pub timeout: Option<Duration>,
}

impl CompiledRoute {
    /// Header criteria from the v2 match block; all must hold.
    pub fn headers_match(&self, headers: &HeaderMap) -> bool {
        self.header_matches.iter().all(|hm| {
            let value = headers
                .get(hm.name.as_str())
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            if !hm.exact.is_empty() && value != hm.exact {
                return false;
            }
            if !hm.contains.is_empty() && !value.contains(hm.contains.as_str()) {
                return false;
            }
            true
        })
    }

    /// The path rule text that matched `request_path`, used as the strip
    /// point for prefix rewriting.
    pub fn matched_path(&self, request_path: &str) -> Option<&str> {
        self.path_rules.iter().find_map(|rule| {
            let hit = match rule.match_type {
                MatchType::Exact => request_path == rule.path,
                MatchType::Prefix => request_path.starts_with(rule.path.as_str()),
            };
            hit.then_some(rule.path.as_str())
        })
    }
}

/// Exact-map key: `(method, host, path)`. Method "" indexes routes that
/// accept any method.
type ExactKey = (String, String, String);

#[derive(Debug)]
pub(crate) struct PrefixEntry {
    pub host: String,
    pub prefix: String,
    pub methods: Option<Vec<String>>,
    pub route: Arc<CompiledRoute>,
}

/// Immutable routing table: exact lookups by hash, prefix lookups over a
/// length-descending (lexicographically tiebroken) list.
#[derive(Debug)]
pub struct RouteIndex {
    exact: HashMap<ExactKey, Arc<CompiledRoute>>,
    prefix: Vec<PrefixEntry>,
}

impl RouteIndex {
    pub(crate) fn new(
        exact: HashMap<ExactKey, Arc<CompiledRoute>>,
        mut prefix: Vec<PrefixEntry>,
    ) -> Self {
        // Longest prefix first; lexicographic order breaks length ties so
        // matching is deterministic.
        prefix.sort_by(|a, b| {
            b.prefix
                .len()
                .cmp(&a.prefix.len())
                .then_with(|| a.prefix.cmp(&b.prefix))
        });
        Self { exact, prefix }
    }

    pub fn exact_len(&self) -> usize {
        self.exact.len()
    }

    pub fn prefix_len(&self) -> usize {
        self.prefix.len()
    }

    /// Find the best route for `(method, host, path)`. The host may still
    /// carry a `:port` suffix; the path is used verbatim. Never blocks and
    /// has no failure mode beyond `None`.
    pub fn find(
        &self,
        method: &str,
        host: &str,
        path: &str,
        headers: &HeaderMap,
    ) -> Option<Arc<CompiledRoute>> {
        let host = strip_port(host);

        // Exact probes: method-specific before method-wildcard, concrete host
        // before wildcard host.
        let probes = [
            (method, host),
            (method, ""),
            ("", host),
            ("", ""),
        ];
        for (m, h) in probes {
            let key = (m.to_string(), h.to_string(), path.to_string());
            if let Some(route) = self.exact.get(&key) {
                if route.headers_match(headers) {
                    return Some(Arc::clone(route));
                }
            }
        }

        // Prefix scan, longest first.
        for entry in &self.prefix {
            if !path.starts_with(entry.prefix.as_str()) {
                continue;
            }
            if !entry.host.is_empty() && entry.host != host {
                continue;
            }
            if let Some(methods) = &entry.methods {
                if !methods.iter().any(|m| m == method) {
                    continue;
                }
            }
            if entry.route.headers_match(headers) {
                return Some(Arc::clone(&entry.route));
            }
        }

        None
    }
}

/// Strip a trailing `:port` from a Host header value.
fn strip_port(host: &str) -> &str {
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

/// The immutable unit of swap.
#[derive(Debug)]
pub struct Snapshot {
    pub router: RouteIndex,
    pub clusters: HashMap<String, Arc<CompiledCluster>>,
    pub version: u64,
}

impl Snapshot {
    pub fn cluster(&self, name: &str) -> Option<&Arc<CompiledCluster>> {
        self.clusters.get(name)
    }
}

/// Atomically published current snapshot. The data plane loads the pointer
/// once per request; the Config Center is the only writer. An old snapshot is
/// reclaimed when the last in-flight request holding it completes.
#[derive(Default)]
pub struct SnapshotStore {
    current: ArcSwapOption<Snapshot>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a new snapshot. Visible to every subsequent `load`.
    pub fn store(&self, snapshot: Arc<Snapshot>) {
        self.current.store(Some(snapshot));
    }

    /// Load the current snapshot; `None` until the first publish.
    pub fn load(&self) -> Option<Arc<Snapshot>> {
        self.current.load_full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(name: &str, host: &str, rules: Vec<CompiledPathRule>) -> Arc<CompiledRoute> {
        Arc::new(CompiledRoute {
            name: name.to_string(),
            host: host.to_string(),
            path_rules: rules,
            header_matches: Vec::new(),
            filters: Vec::new(),
            rewrite: None,
            wire: Protocol::Http,
            grpc: None,
            dubbo: None,
            cluster_name: "backend".to_string(),
            timeout: None,
        })
    }

    fn exact_rule(path: &str) -> CompiledPathRule {
        CompiledPathRule {
            path: path.to_string(),
            match_type: MatchType::Exact,
            methods: None,
        }
    }

    fn prefix_rule(path: &str) -> CompiledPathRule {
        CompiledPathRule {
            path: path.to_string(),
            match_type: MatchType::Prefix,
            methods: None,
        }
    }

    fn index_with(
        exact: Vec<(ExactKey, Arc<CompiledRoute>)>,
        prefix: Vec<PrefixEntry>,
    ) -> RouteIndex {
        RouteIndex::new(exact.into_iter().collect(), prefix)
    }

    #[test]
    fn exact_match_beats_prefix() {
        let exact = route("exact", "", vec![exact_rule("/api/v1")]);
        let pfx = route("pfx", "", vec![prefix_rule("/api")]);

        let index = index_with(
            vec![(
                (String::new(), String::new(), "/api/v1".to_string()),
                Arc::clone(&exact),
            )],
            vec![PrefixEntry {
                host: String::new(),
                prefix: "/api".to_string(),
                methods: None,
                route: pfx,
            }],
        );

        let headers = HeaderMap::new();
        let hit = index.find("GET", "example.com", "/api/v1", &headers).unwrap();
        assert_eq!(hit.name, "exact");
    }

    #[test]
    fn prefix_matches_itself_and_children_but_not_siblings() {
        let r = route("api", "", vec![prefix_rule("/api")]);
        let index = index_with(
            vec![],
            vec![PrefixEntry {
                host: String::new(),
                prefix: "/api".to_string(),
                methods: None,
                route: r,
            }],
        );

        let headers = HeaderMap::new();
        assert!(index.find("GET", "h", "/api", &headers).is_some());
        assert!(index.find("GET", "h", "/api/x", &headers).is_some());
        assert!(index.find("GET", "h", "/apix", &headers).is_none());
    }

    #[test]
    fn longest_prefix_wins_over_shorter() {
        let short = route("short", "", vec![prefix_rule("/api")]);
        let long = route("long", "", vec![prefix_rule("/api/v2")]);

        let index = index_with(
            vec![],
            vec![
                PrefixEntry {
                    host: String::new(),
                    prefix: "/api".to_string(),
                    methods: None,
                    route: short,
                },
                PrefixEntry {
                    host: String::new(),
                    prefix: "/api/v2".to_string(),
                    methods: None,
                    route: long,
                },
            ],
        );

        let headers = HeaderMap::new();
        let hit = index.find("GET", "h", "/api/v2/x", &headers).unwrap();
        assert_eq!(hit.name, "long");
        let hit = index.find("GET", "h", "/api/v1/x", &headers).unwrap();
        assert_eq!(hit.name, "short");
    }

    #[test]
    fn host_rules_require_exact_match_after_port_strip() {
        let hosted = route("hosted", "api.example.com", vec![exact_rule("/v1/x")]);
        let index = index_with(
            vec![(
                (
                    String::new(),
                    "api.example.com".to_string(),
                    "/v1/x".to_string(),
                ),
                hosted,
            )],
            vec![],
        );

        let headers = HeaderMap::new();
        assert!(
            index
                .find("GET", "api.example.com:8080", "/v1/x", &headers)
                .is_some()
        );
        assert!(
            index
                .find("GET", "other.example.com", "/v1/x", &headers)
                .is_none()
        );
    }

    #[test]
    fn empty_host_rule_matches_any_inbound_host() {
        let wildcard = route("wildcard", "", vec![exact_rule("/v1/x")]);
        let index = index_with(
            vec![(
                (String::new(), String::new(), "/v1/x".to_string()),
                wildcard,
            )],
            vec![],
        );

        let headers = HeaderMap::new();
        assert!(index.find("GET", "anything.example", "/v1/x", &headers).is_some());
    }

    #[test]
    fn method_restricted_prefix_entry_filters_methods() {
        let r = route("writes", "", vec![prefix_rule("/api")]);
        let index = index_with(
            vec![],
            vec![PrefixEntry {
                host: String::new(),
                prefix: "/api".to_string(),
                methods: Some(vec!["POST".to_string()]),
                route: r,
            }],
        );

        let headers = HeaderMap::new();
        assert!(index.find("POST", "h", "/api/x", &headers).is_some());
        assert!(index.find("GET", "h", "/api/x", &headers).is_none());
    }

    #[test]
    fn header_criteria_gate_the_match() {
        let mut r = CompiledRoute {
            name: "beta".to_string(),
            host: String::new(),
            path_rules: vec![prefix_rule("/api")],
            header_matches: vec![HeaderMatch {
                name: "x-canary".to_string(),
                exact: "on".to_string(),
                contains: String::new(),
            }],
            filters: Vec::new(),
            rewrite: None,
            wire: Protocol::Http,
            grpc: None,
            dubbo: None,
            cluster_name: "backend".to_string(),
            timeout: None,
        };
        r.header_matches.push(HeaderMatch {
            name: "user-agent".to_string(),
            exact: String::new(),
            contains: "curl".to_string(),
        });
        let index = index_with(
            vec![],
            vec![PrefixEntry {
                host: String::new(),
                prefix: "/api".to_string(),
                methods: None,
                route: Arc::new(r),
            }],
        );

        let mut headers = HeaderMap::new();
        assert!(index.find("GET", "h", "/api/x", &headers).is_none());

        headers.insert("x-canary", "on".parse().unwrap());
        headers.insert("user-agent", "curl/8.0".parse().unwrap());
        assert!(index.find("GET", "h", "/api/x", &headers).is_some());
    }

    #[test]
    fn matched_path_reports_the_hit_rule() {
        let r = route(
            "r",
            "",
            vec![exact_rule("/v1/users"), prefix_rule("/v1")],
        );
        assert_eq!(r.matched_path("/v1/users"), Some("/v1/users"));
        assert_eq!(r.matched_path("/v1/other"), Some("/v1"));
        assert_eq!(r.matched_path("/v2"), None);
    }

    #[test]
    fn snapshot_store_swaps_atomically() {
        let store = SnapshotStore::new();
        assert!(store.load().is_none());

        let snap = Arc::new(Snapshot {
            router: RouteIndex::new(HashMap::new(), Vec::new()),
            clusters: HashMap::new(),
            version: 1,
        });
        store.store(Arc::clone(&snap));
        assert_eq!(store.load().unwrap().version, 1);

        let snap2 = Arc::new(Snapshot {
            router: RouteIndex::new(HashMap::new(), Vec::new()),
            clusters: HashMap::new(),
            version: 2,
        });
        store.store(snap2);
        assert_eq!(store.load().unwrap().version, 2);
        // The first snapshot is still usable by holders of the old Arc.
        assert_eq!(snap.version, 1);
    }
}
