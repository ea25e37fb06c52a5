//! Config → Snapshot compilation.
//!
//! Everything by-name becomes a direct handle here: routes resolve their
//! clusters, filters are parsed once, gRPC/Dubbo destinations are normalized,
//! and the route index is built and sorted. Compilation is all-or-nothing; a
//! failure at any step leaves the currently published snapshot untouched.
use std::{collections::HashMap, sync::Arc, time::Duration};

use eyre::{WrapErr, bail, eyre};

use crate::{
    config::models::{
        Cluster, Config, LoadBalancerKind, MatchType, Protocol, Route, RouteFilter, RouteV2,
        Upstream,
    },
    core::{
        circuit_breaker::{BreakerState, CircuitBreaker},
        cluster::{CompiledCluster, CompiledEndpoint},
        filter::Filter,
        snapshot::{
            CompiledPathRule, CompiledRoute, DubboTarget, GrpcTarget, PrefixEntry, RouteIndex,
            Snapshot,
        },
    },
    metrics,
};

/// Compile a validated configuration into a snapshot. Circuit breakers are
/// carried forward from `prev` by cluster name so breaker history survives a
/// reload; clusters that vanished abandon their state with the old snapshot.
pub fn compile(cfg: &Config, prev: Option<&Snapshot>, version: u64) -> eyre::Result<Snapshot> {
    let clusters = compile_clusters(cfg, prev)?;

    let mut exact: HashMap<(String, String, String), Arc<CompiledRoute>> = HashMap::new();
    let mut prefix: Vec<PrefixEntry> = Vec::new();

    for route in &cfg.routes {
        let compiled = Arc::new(
            compile_v1_route(route, &clusters)
                .wrap_err_with(|| format!("route {:?}", route.name))?,
        );
        index_route(&compiled, &mut exact, &mut prefix)?;
    }

    for route in &cfg.routes_v2 {
        let compiled = Arc::new(
            compile_v2_route(route, &clusters)
                .wrap_err_with(|| format!("route {:?}", route.name))?,
        );
        index_route(&compiled, &mut exact, &mut prefix)?;
    }

    Ok(Snapshot {
        router: RouteIndex::new(exact, prefix),
        clusters,
        version,
    })
}

fn compile_clusters(
    cfg: &Config,
    prev: Option<&Snapshot>,
) -> eyre::Result<HashMap<String, Arc<CompiledCluster>>> {
    let mut clusters = HashMap::new();

    for cluster in &cfg.clusters {
        let compiled = compile_cluster(cluster, cfg, prev)?;
        clusters.insert(cluster.name.clone(), Arc::new(compiled));
    }
    for upstream in &cfg.upstreams {
        let compiled = compile_upstream(upstream, cfg, prev)?;
        clusters.insert(upstream.name.clone(), Arc::new(compiled));
    }

    Ok(clusters)
}

fn compile_cluster(
    cluster: &Cluster,
    cfg: &Config,
    prev: Option<&Snapshot>,
) -> eyre::Result<CompiledCluster> {
    let endpoints = cluster
        .endpoints
        .iter()
        .map(|ep| {
            let addr = ep.address();
            if addr.is_empty() {
                bail!("cluster {:?}: endpoint with no url, target, or addr", cluster.name);
            }
            Ok(Arc::new(CompiledEndpoint::new(addr)))
        })
        .collect::<eyre::Result<Vec<_>>>()?;

    Ok(CompiledCluster::new(
        cluster.name.clone(),
        cluster.protocol,
        endpoints,
        cluster.lb,
        cluster.keepalive.clone(),
        cluster.grpc.clone(),
        cluster.dubbo.clone(),
        cluster.health_check.clone(),
        breaker_for(&cluster.name, cfg, prev),
    ))
}

fn compile_upstream(
    upstream: &Upstream,
    cfg: &Config,
    prev: Option<&Snapshot>,
) -> eyre::Result<CompiledCluster> {
    let endpoints = upstream
        .targets
        .iter()
        .map(|t| {
            if t.address.is_empty() {
                bail!("upstream {:?}: target with empty address", upstream.name);
            }
            Ok(Arc::new(CompiledEndpoint::new(t.address.as_str())))
        })
        .collect::<eyre::Result<Vec<_>>>()?;

    Ok(CompiledCluster::new(
        upstream.name.clone(),
        Protocol::Http,
        endpoints,
        upstream.algorithm.unwrap_or(LoadBalancerKind::RoundRobin),
        None,
        None,
        None,
        upstream.health_check.clone(),
        breaker_for(&upstream.name, cfg, prev),
    ))
}

/// Reuse the previous snapshot's breaker for a surviving cluster; otherwise
/// create a fresh one wired to the state-change log and gauge.
fn breaker_for(
    name: &str,
    cfg: &Config,
    prev: Option<&Snapshot>,
) -> Option<Arc<CircuitBreaker>> {
    if !cfg.circuit_breaker.enabled {
        return None;
    }

    if let Some(existing) = prev
        .and_then(|s| s.clusters.get(name))
        .and_then(|c| c.breaker.clone())
    {
        return Some(existing);
    }

    let breaker = Arc::new(CircuitBreaker::new(
        name,
        cfg.circuit_breaker.failure_threshold,
        cfg.circuit_breaker.success_threshold,
        cfg.circuit_breaker.timeout,
    ));
    breaker.set_on_state_change(Box::new(observe_breaker_transition));
    metrics::set_breaker_state(name, BreakerState::Closed);
    Some(breaker)
}

fn observe_breaker_transition(name: &str, from: BreakerState, to: BreakerState) {
    tracing::warn!(
        cluster = name,
        from = %from,
        to = %to,
        "circuit breaker state change"
    );
    metrics::set_breaker_state(name, to);
}

fn compile_v1_route(
    route: &Route,
    clusters: &HashMap<String, Arc<CompiledCluster>>,
) -> eyre::Result<CompiledRoute> {
    let cluster = clusters
        .get(&route.upstream)
        .ok_or_else(|| eyre!("references unknown cluster {:?}", route.upstream))?;

    let path_rules = route
        .paths
        .iter()
        .map(|p| CompiledPathRule {
            path: p.path.clone(),
            match_type: p.match_type,
            methods: p.methods.clone(),
        })
        .collect();

    // A protocol-tagged rewrite overrides the cluster's wire protocol so an
    // HTTP cluster can front a transcoded backend.
    let wire = match route.rewrite.as_ref().map(|rw| rw.protocol) {
        Some(Protocol::Grpc) => Protocol::Grpc,
        Some(Protocol::Dubbo) => Protocol::Dubbo,
        _ => cluster.protocol,
    };

    let grpc = route
        .rewrite
        .as_ref()
        .and_then(|rw| rw.grpc.as_ref())
        .map(|g| GrpcTarget {
            service: g.service.clone(),
            method: g.method.clone(),
        });

    let dubbo = route.rewrite.as_ref().and_then(|rw| rw.dubbo.as_ref()).map(|d| {
        let cluster_dubbo = cluster.dubbo.as_ref();
        DubboTarget {
            interface: d.service.clone(),
            method: d.method.clone(),
            param_types: Vec::new(),
            group: non_empty_or(&d.group, cluster_dubbo.map(|c| c.group.as_str())),
            version: non_empty_or(&d.version, cluster_dubbo.map(|c| c.version.as_str())),
        }
    });

    let compiled = CompiledRoute {
        name: route.name.clone(),
        host: route.host.clone(),
        path_rules,
        header_matches: Vec::new(),
        filters: compile_filters(&route.filters)?,
        rewrite: route.rewrite.clone(),
        wire,
        grpc,
        dubbo,
        cluster_name: route.upstream.clone(),
        timeout: None,
    };
    check_wire_targets(&compiled)?;
    Ok(compiled)
}

fn compile_v2_route(
    route: &RouteV2,
    clusters: &HashMap<String, Arc<CompiledCluster>>,
) -> eyre::Result<CompiledRoute> {
    let cluster = clusters
        .get(&route.upstream.cluster)
        .ok_or_else(|| eyre!("references unknown cluster {:?}", route.upstream.cluster))?;

    let methods = if route.matcher.methods.is_empty() {
        None
    } else {
        Some(route.matcher.methods.clone())
    };

    let mut path_rules = Vec::new();
    if !route.matcher.path.is_empty() {
        path_rules.push(CompiledPathRule {
            path: route.matcher.path.clone(),
            match_type: MatchType::Exact,
            methods: methods.clone(),
        });
    }
    if !route.matcher.path_prefix.is_empty() {
        path_rules.push(CompiledPathRule {
            path: route.matcher.path_prefix.clone(),
            match_type: MatchType::Prefix,
            methods: methods.clone(),
        });
    }
    if path_rules.is_empty() {
        // Neither path nor prefix: catch-all.
        path_rules.push(CompiledPathRule {
            path: "/".to_string(),
            match_type: MatchType::Prefix,
            methods,
        });
    }

    let grpc = route.upstream.grpc.as_ref().map(|g| GrpcTarget {
        service: g.service.clone(),
        method: g.method.clone(),
    });
    let dubbo = route.upstream.dubbo.as_ref().map(|d| {
        let cluster_dubbo = cluster.dubbo.as_ref();
        DubboTarget {
            interface: d.interface.clone(),
            method: d.method.clone(),
            param_types: d.param_types.clone(),
            group: cluster_dubbo.map(|c| c.group.clone()).unwrap_or_default(),
            version: cluster_dubbo.map(|c| c.version.clone()).unwrap_or_default(),
        }
    });

    let compiled = CompiledRoute {
        name: route.name.clone(),
        host: String::new(),
        path_rules,
        header_matches: route.matcher.headers.clone(),
        filters: compile_filters(&route.filters)?,
        rewrite: None,
        wire: cluster.protocol,
        grpc,
        dubbo,
        cluster_name: route.upstream.cluster.clone(),
        timeout: route.upstream.timeout_ms.map(Duration::from_millis),
    };
    check_wire_targets(&compiled)?;
    Ok(compiled)
}

fn compile_filters(filters: &[RouteFilter]) -> eyre::Result<Vec<Filter>> {
    filters
        .iter()
        .map(|f| {
            Filter::compile(&f.filter_type, &f.args)
                .wrap_err_with(|| format!("filter {:?}", f.filter_type))
        })
        .collect()
}

fn check_wire_targets(route: &CompiledRoute) -> eyre::Result<()> {
    match route.wire {
        Protocol::Grpc if route.grpc.is_none() => {
            bail!("gRPC upstream requires a grpc service/method target")
        }
        Protocol::Dubbo if route.dubbo.is_none() => {
            bail!("Dubbo upstream requires a dubbo interface/method target")
        }
        _ => Ok(()),
    }
}

/// Index a compiled route into the exact map and prefix list. Duplicate
/// exact `(method, host, path)` keys abort the build.
fn index_route(
    route: &Arc<CompiledRoute>,
    exact: &mut HashMap<(String, String, String), Arc<CompiledRoute>>,
    prefix: &mut Vec<PrefixEntry>,
) -> eyre::Result<()> {
    for rule in &route.path_rules {
        match rule.match_type {
            MatchType::Exact => {
                let methods: Vec<String> = match &rule.methods {
                    Some(ms) => ms.clone(),
                    None => vec![String::new()],
                };
                for method in methods {
                    let key = (method, route.host.clone(), rule.path.clone());
                    if exact.contains_key(&key) {
                        bail!(
                            "route {:?}: duplicate exact rule for ({}, {}, {})",
                            route.name,
                            if key.0.is_empty() { "*" } else { &key.0 },
                            if key.1.is_empty() { "*" } else { &key.1 },
                            key.2
                        );
                    }
                    exact.insert(key, Arc::clone(route));
                }
            }
            MatchType::Prefix => prefix.push(PrefixEntry {
                host: route.host.clone(),
                prefix: rule.path.clone(),
                methods: rule.methods.clone(),
                route: Arc::clone(route),
            }),
        }
    }

    Ok(())
}

fn non_empty_or(value: &str, fallback: Option<&str>) -> String {
    if !value.is_empty() {
        value.to_string()
    } else {
        fallback.unwrap_or_default().to_string()
    }
}

#[cfg(test)]
mod tests {
    use http::HeaderMap;

    use super::*;
    use crate::config::models::{
        ClusterEndpoint, GrpcRewrite, PathRule, RewriteRule, RouteMatch, RouteUpstream,
        RouteUpstreamGrpc, Target,
    };

    fn base_config() -> Config {
        let mut cfg = Config::default();
        cfg.clusters.push(Cluster {
            name: "backend".to_string(),
            endpoints: vec![ClusterEndpoint {
                url: "http://127.0.0.1:9001".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        });
        cfg
    }

    fn v1_route(name: &str, host: &str, path: &str, match_type: MatchType) -> Route {
        Route {
            name: name.to_string(),
            host: host.to_string(),
            paths: vec![PathRule {
                path: path.to_string(),
                match_type,
                methods: None,
            }],
            upstream: "backend".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn compiles_routes_and_resolves_clusters() {
        let mut cfg = base_config();
        cfg.routes
            .push(v1_route("users", "api.example.com", "/v1/users", MatchType::Exact));

        let snap = compile(&cfg, None, 1).unwrap();
        assert_eq!(snap.version, 1);
        assert_eq!(snap.router.exact_len(), 1);

        let headers = HeaderMap::new();
        let route = snap
            .router
            .find("GET", "api.example.com", "/v1/users", &headers)
            .unwrap();
        assert!(snap.cluster(&route.cluster_name).is_some());
    }

    #[test]
    fn unknown_cluster_aborts_compilation() {
        let mut cfg = base_config();
        let mut route = v1_route("broken", "", "/x", MatchType::Exact);
        route.upstream = "missing".to_string();
        cfg.routes.push(route);

        let err = compile(&cfg, None, 1).unwrap_err();
        assert!(err.to_string().contains("broken"));
    }

    #[test]
    fn duplicate_exact_key_aborts_compilation() {
        let mut cfg = base_config();
        cfg.routes.push(v1_route("a", "", "/v1/x", MatchType::Exact));
        cfg.routes.push(v1_route("b", "", "/v1/x", MatchType::Exact));

        let err = compile(&cfg, None, 1).unwrap_err();
        assert!(format!("{err:#}").contains("duplicate exact rule"));
    }

    #[test]
    fn unknown_filter_type_aborts_compilation() {
        let mut cfg = base_config();
        let mut route = v1_route("f", "", "/v1/x", MatchType::Exact);
        route.filters.push(RouteFilter {
            filter_type: "bogus".to_string(),
            args: HashMap::new(),
        });
        cfg.routes.push(route);

        assert!(compile(&cfg, None, 1).is_err());
    }

    #[test]
    fn grpc_rewrite_sets_wire_protocol() {
        let mut cfg = base_config();
        let mut route = v1_route("hello", "", "/api/hello", MatchType::Exact);
        route.rewrite = Some(RewriteRule {
            protocol: Protocol::Grpc,
            grpc: Some(GrpcRewrite {
                service: "helloworld.Greeter".to_string(),
                method: "SayHello".to_string(),
            }),
            ..Default::default()
        });
        cfg.routes.push(route);

        let snap = compile(&cfg, None, 1).unwrap();
        let headers = HeaderMap::new();
        let route = snap.router.find("POST", "h", "/api/hello", &headers).unwrap();
        assert_eq!(route.wire, Protocol::Grpc);
        assert_eq!(route.grpc.as_ref().unwrap().service, "helloworld.Greeter");
    }

    #[test]
    fn grpc_cluster_without_target_is_rejected() {
        let mut cfg = Config::default();
        cfg.clusters.push(Cluster {
            name: "grpc-be".to_string(),
            protocol: Protocol::Grpc,
            endpoints: vec![ClusterEndpoint {
                target: "127.0.0.1:50051".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        });
        cfg.routes_v2.push(RouteV2 {
            name: "grpc-route".to_string(),
            matcher: RouteMatch {
                path_prefix: "/api".to_string(),
                ..Default::default()
            },
            upstream: RouteUpstream {
                cluster: "grpc-be".to_string(),
                ..Default::default()
            },
            ..Default::default()
        });

        assert!(compile(&cfg, None, 1).is_err());

        cfg.routes_v2[0].upstream.grpc = Some(RouteUpstreamGrpc {
            service: "pkg.Svc".to_string(),
            method: "Call".to_string(),
        });
        assert!(compile(&cfg, None, 1).is_ok());
    }

    #[test]
    fn v2_route_without_path_is_catch_all() {
        let mut cfg = base_config();
        cfg.routes_v2.push(RouteV2 {
            name: "all".to_string(),
            upstream: RouteUpstream {
                cluster: "backend".to_string(),
                ..Default::default()
            },
            ..Default::default()
        });

        let snap = compile(&cfg, None, 1).unwrap();
        let headers = HeaderMap::new();
        assert!(snap.router.find("GET", "h", "/anything", &headers).is_some());
    }

    #[test]
    fn upstreams_compile_into_http_clusters() {
        let mut cfg = Config::default();
        cfg.upstreams.push(Upstream {
            name: "legacy".to_string(),
            targets: vec![Target {
                address: "http://127.0.0.1:9002".to_string(),
                weight: 1,
            }],
            ..Default::default()
        });
        cfg.routes.push(Route {
            name: "legacy-route".to_string(),
            paths: vec![PathRule {
                path: "/legacy".to_string(),
                match_type: MatchType::Prefix,
                methods: None,
            }],
            upstream: "legacy".to_string(),
            ..Default::default()
        });

        let snap = compile(&cfg, None, 1).unwrap();
        let cluster = snap.cluster("legacy").unwrap();
        assert_eq!(cluster.protocol, Protocol::Http);
        assert_eq!(cluster.endpoints[0].address(), "http://127.0.0.1:9002");
    }

    #[test]
    fn breakers_are_carried_forward_by_cluster_name() {
        let mut cfg = base_config();
        cfg.circuit_breaker.enabled = true;

        let first = compile(&cfg, None, 1).unwrap();
        let breaker1 = first.cluster("backend").unwrap().breaker.clone().unwrap();
        breaker1.record_failure();

        let second = compile(&cfg, Some(&first), 2).unwrap();
        let breaker2 = second.cluster("backend").unwrap().breaker.clone().unwrap();
        assert!(Arc::ptr_eq(&breaker1, &breaker2));

        // A brand-new cluster gets a fresh breaker.
        cfg.clusters.push(Cluster {
            name: "other".to_string(),
            endpoints: vec![ClusterEndpoint {
                url: "http://127.0.0.1:9003".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        });
        let third = compile(&cfg, Some(&second), 3).unwrap();
        assert!(third.cluster("other").unwrap().breaker.is_some());
    }

    #[test]
    fn endpoint_health_resets_on_fresh_snapshot() {
        let cfg = base_config();
        let first = compile(&cfg, None, 1).unwrap();
        first.cluster("backend").unwrap().endpoints[0].set_healthy(false);

        let second = compile(&cfg, Some(&first), 2).unwrap();
        assert!(second.cluster("backend").unwrap().endpoints[0].is_healthy());
    }
}
