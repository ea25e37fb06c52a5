//! Configuration validation.
//!
//! Structural checks plus the cross-reference rules the compiler depends on:
//! route → cluster references, filter argument presence, gRPC/Dubbo target
//! completeness. Errors are collected so one pass reports everything wrong
//! with a config file.
use std::{collections::HashSet, net::SocketAddr};

use crate::config::models::{
    Config, Protocol, RewriteRule, Route, RouteFilter, RouteV2, TlsConfig,
};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Invalid TLS configuration: {message}")]
    InvalidTls { message: String },

    #[error("Route '{route}' references unknown cluster '{cluster}'")]
    UnknownCluster { route: String, cluster: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Gateway configuration validator
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the entire configuration.
    pub fn validate(config: &Config) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_listen_address(&config.server.listen) {
            errors.push(e);
        }
        if let Some(tls) = &config.server.tls {
            if let Err(e) = Self::validate_tls(tls) {
                errors.push(e);
            }
        }

        let cluster_names = Self::validate_cluster_names(config, &mut errors);

        for route in &config.routes {
            Self::validate_route(route, &cluster_names, &mut errors);
        }
        for route in &config.routes_v2 {
            Self::validate_route_v2(route, &cluster_names, &mut errors);
        }

        if config.rate_limit.enabled {
            if config.rate_limit.rate == 0 {
                errors.push(ValidationError::InvalidField {
                    field: "rate_limit.rate".to_string(),
                    message: "must be greater than 0".to_string(),
                });
            }
            if config.rate_limit.window.is_zero() {
                errors.push(ValidationError::InvalidField {
                    field: "rate_limit.window".to_string(),
                    message: "must be greater than 0".to_string(),
                });
            }
        }

        if config.auth.api_key.enabled && config.auth.api_key.keys.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "auth.api_key.keys".to_string(),
            });
        }

        if config.circuit_breaker.enabled {
            if config.circuit_breaker.failure_threshold == 0 {
                errors.push(ValidationError::InvalidField {
                    field: "circuit_breaker.failure_threshold".to_string(),
                    message: "must be greater than 0".to_string(),
                });
            }
            if config.circuit_breaker.success_threshold == 0 {
                errors.push(ValidationError::InvalidField {
                    field: "circuit_breaker.success_threshold".to_string(),
                    message: "must be greater than 0".to_string(),
                });
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: "Must be in format 'IP:PORT' (e.g., '127.0.0.1:8080' or '0.0.0.0:8080')"
                    .to_string(),
            });
        }
        Ok(())
    }

    fn validate_tls(tls: &TlsConfig) -> ValidationResult<()> {
        if !tls.enabled {
            return Ok(());
        }
        if tls.cert_file.is_empty() || tls.key_file.is_empty() {
            return Err(ValidationError::InvalidTls {
                message: "cert_file and key_file are required when TLS is enabled".to_string(),
            });
        }
        if tls.min_version != "1.2" && tls.min_version != "1.3" {
            return Err(ValidationError::InvalidTls {
                message: format!(
                    "min_version must be '1.2' or '1.3', got '{}'",
                    tls.min_version
                ),
            });
        }
        Ok(())
    }

    /// Validate upstream/cluster definitions and collect the set of
    /// resolvable names.
    fn validate_cluster_names(
        config: &Config,
        errors: &mut Vec<ValidationError>,
    ) -> HashSet<String> {
        let mut names = HashSet::new();

        for (i, upstream) in config.upstreams.iter().enumerate() {
            if upstream.name.is_empty() {
                errors.push(ValidationError::MissingField {
                    field: format!("upstreams[{i}].name"),
                });
                continue;
            }
            if !names.insert(upstream.name.clone()) {
                errors.push(ValidationError::InvalidField {
                    field: format!("upstreams[{i}].name"),
                    message: format!("duplicate upstream name '{}'", upstream.name),
                });
            }
            if upstream.targets.is_empty() {
                errors.push(ValidationError::MissingField {
                    field: format!("upstream '{}' targets", upstream.name),
                });
            }
            for (j, target) in upstream.targets.iter().enumerate() {
                if target.address.is_empty() {
                    errors.push(ValidationError::MissingField {
                        field: format!("upstream '{}' targets[{j}].address", upstream.name),
                    });
                }
            }
        }

        for (i, cluster) in config.clusters.iter().enumerate() {
            if cluster.name.is_empty() {
                errors.push(ValidationError::MissingField {
                    field: format!("clusters[{i}].name"),
                });
                continue;
            }
            if !names.insert(cluster.name.clone()) {
                errors.push(ValidationError::InvalidField {
                    field: format!("clusters[{i}].name"),
                    message: format!("duplicate cluster name '{}'", cluster.name),
                });
            }
            if cluster.endpoints.is_empty() {
                errors.push(ValidationError::MissingField {
                    field: format!("cluster '{}' endpoints", cluster.name),
                });
            }
            for (j, ep) in cluster.endpoints.iter().enumerate() {
                if ep.address().is_empty() {
                    errors.push(ValidationError::MissingField {
                        field: format!(
                            "cluster '{}' endpoints[{j}]: url, target, or addr",
                            cluster.name
                        ),
                    });
                }
            }
        }

        names
    }

    fn validate_route(
        route: &Route,
        cluster_names: &HashSet<String>,
        errors: &mut Vec<ValidationError>,
    ) {
        if route.name.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "routes[].name".to_string(),
            });
        }
        if route.upstream.is_empty() {
            errors.push(ValidationError::MissingField {
                field: format!("route '{}' upstream", route.name),
            });
        } else if !cluster_names.contains(&route.upstream) {
            errors.push(ValidationError::UnknownCluster {
                route: route.name.clone(),
                cluster: route.upstream.clone(),
            });
        }
        if route.paths.is_empty() {
            errors.push(ValidationError::MissingField {
                field: format!("route '{}' paths", route.name),
            });
        }
        for (j, rule) in route.paths.iter().enumerate() {
            if rule.path.is_empty() {
                errors.push(ValidationError::MissingField {
                    field: format!("route '{}' paths[{j}].path", route.name),
                });
            } else if !rule.path.starts_with('/') {
                errors.push(ValidationError::InvalidField {
                    field: format!("route '{}' paths[{j}].path", route.name),
                    message: "paths must start with '/'".to_string(),
                });
            }
        }
        if let Some(rewrite) = &route.rewrite {
            Self::validate_rewrite(&route.name, rewrite, errors);
        }
        Self::validate_filters(&route.name, &route.filters, errors);
    }

    fn validate_rewrite(route: &str, rewrite: &RewriteRule, errors: &mut Vec<ValidationError>) {
        match rewrite.protocol {
            Protocol::Http => {}
            Protocol::Grpc => match &rewrite.grpc {
                None => errors.push(ValidationError::MissingField {
                    field: format!("route '{route}' rewrite.grpc"),
                }),
                Some(g) => {
                    if g.service.is_empty() || g.method.is_empty() {
                        errors.push(ValidationError::MissingField {
                            field: format!("route '{route}' rewrite.grpc.service/method"),
                        });
                    }
                }
            },
            Protocol::Dubbo => match &rewrite.dubbo {
                None => errors.push(ValidationError::MissingField {
                    field: format!("route '{route}' rewrite.dubbo"),
                }),
                Some(d) => {
                    if d.service.is_empty() || d.method.is_empty() {
                        errors.push(ValidationError::MissingField {
                            field: format!("route '{route}' rewrite.dubbo.service/method"),
                        });
                    }
                }
            },
        }
    }

    fn validate_route_v2(
        route: &RouteV2,
        cluster_names: &HashSet<String>,
        errors: &mut Vec<ValidationError>,
    ) {
        if route.name.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "routes_v2[].name".to_string(),
            });
        }
        if route.matcher.path.is_empty() && route.matcher.path_prefix.is_empty() {
            errors.push(ValidationError::MissingField {
                field: format!("route '{}' match.path or match.path_prefix", route.name),
            });
        }
        if route.upstream.cluster.is_empty() {
            errors.push(ValidationError::MissingField {
                field: format!("route '{}' upstream.cluster", route.name),
            });
        } else if !cluster_names.contains(&route.upstream.cluster) {
            errors.push(ValidationError::UnknownCluster {
                route: route.name.clone(),
                cluster: route.upstream.cluster.clone(),
            });
        }

        Self::validate_filters(&route.name, &route.filters, errors);

        if let Some(grpc) = &route.upstream.grpc {
            if grpc.service.is_empty() || grpc.method.is_empty() {
                errors.push(ValidationError::MissingField {
                    field: format!("route '{}' upstream.grpc.service/method", route.name),
                });
            }
        }
        if let Some(dubbo) = &route.upstream.dubbo {
            if dubbo.interface.is_empty() || dubbo.method.is_empty() {
                errors.push(ValidationError::MissingField {
                    field: format!("route '{}' upstream.dubbo.interface/method", route.name),
                });
            }
        }
    }

    fn validate_filters(
        route: &str,
        filters: &[RouteFilter],
        errors: &mut Vec<ValidationError>,
    ) {
        for (j, filter) in filters.iter().enumerate() {
            match filter.filter_type.as_str() {
                "" => errors.push(ValidationError::MissingField {
                    field: format!("route '{route}' filters[{j}].type"),
                }),
                "strip_prefix" => {
                    if filter.args.get("prefix").map_or(true, String::is_empty) {
                        errors.push(ValidationError::MissingField {
                            field: format!("route '{route}' filters[{j}] (strip_prefix): 'prefix'"),
                        });
                    }
                }
                "header_set" => {
                    if filter.args.get("key").map_or(true, String::is_empty) {
                        errors.push(ValidationError::MissingField {
                            field: format!("route '{route}' filters[{j}] (header_set): 'key'"),
                        });
                    }
                }
                other => errors.push(ValidationError::InvalidField {
                    field: format!("route '{route}' filters[{j}].type"),
                    message: format!("unknown filter type '{other}'"),
                }),
            }
        }
    }

    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        let lines: Vec<String> = errors.iter().map(|e| format!("  - {e}")).collect();
        format!("{} error(s):\n{}", lines.len(), lines.join("\n"))
    }
}
