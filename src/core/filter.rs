//! Compiled request filters.
//!
//! Filters are parsed from declarative `{type, args}` entries once per
//! snapshot; applying one touches only the in-flight request. The set is a
//! closed enum rather than an open registry so snapshot compilation stays
//! pure data.
use std::collections::HashMap;

use axum::body::Body;
use http::{HeaderName, HeaderValue, Request, Uri};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("unknown filter type: {0}")]
    UnknownType(String),

    #[error("{filter} filter requires '{arg}' argument")]
    MissingArg { filter: &'static str, arg: &'static str },

    #[error("{filter} filter: invalid {arg}: {message}")]
    InvalidArg {
        filter: &'static str,
        arg: &'static str,
        message: String,
    },

    #[error("failed to rewrite request path: {0}")]
    PathRewrite(String),
}

/// One compiled filter. Construction validates and resolves all parameters;
/// `apply` performs only cheap per-request work.
#[derive(Debug, Clone)]
pub enum Filter {
    /// Remove a leading path prefix, keeping the result absolute.
    StripPrefix { prefix: String },
    /// Overwrite a request header.
    HeaderSet { key: HeaderName, value: HeaderValue },
}

impl Filter {
    /// Compile a declarative `{type, args}` entry.
    pub fn compile(filter_type: &str, args: &HashMap<String, String>) -> Result<Self, FilterError> {
        match filter_type {
            "strip_prefix" => {
                let prefix = args
                    .get("prefix")
                    .filter(|p| !p.is_empty())
                    .ok_or(FilterError::MissingArg {
                        filter: "strip_prefix",
                        arg: "prefix",
                    })?;
                Ok(Filter::StripPrefix {
                    prefix: prefix.clone(),
                })
            }
            "header_set" => {
                let key = args
                    .get("key")
                    .filter(|k| !k.is_empty())
                    .ok_or(FilterError::MissingArg {
                        filter: "header_set",
                        arg: "key",
                    })?;
                let value = args.get("value").map(String::as_str).unwrap_or("");

                let key = key
                    .parse::<HeaderName>()
                    .map_err(|e| FilterError::InvalidArg {
                        filter: "header_set",
                        arg: "key",
                        message: e.to_string(),
                    })?;
                let value = HeaderValue::from_str(value).map_err(|e| FilterError::InvalidArg {
                    filter: "header_set",
                    arg: "value",
                    message: e.to_string(),
                })?;
                Ok(Filter::HeaderSet { key, value })
            }
            other => Err(FilterError::UnknownType(other.to_string())),
        }
    }

    /// Apply the filter to the in-flight request.
    pub fn apply(&self, req: &mut Request<Body>) -> Result<(), FilterError> {
        match self {
            Filter::StripPrefix { prefix } => {
                let path = req.uri().path();
                if let Some(rest) = path.strip_prefix(prefix.as_str()) {
                    let mut new_path = rest.to_string();
                    if !new_path.starts_with('/') {
                        new_path.insert(0, '/');
                    }
                    set_request_path(req, &new_path)?;
                }
                Ok(())
            }
            Filter::HeaderSet { key, value } => {
                req.headers_mut().insert(key.clone(), value.clone());
                Ok(())
            }
        }
    }
}

/// Replace the path component of a request URI, preserving the query string.
pub(crate) fn set_request_path(req: &mut Request<Body>, path: &str) -> Result<(), FilterError> {
    let uri = req.uri();
    let path_and_query = match uri.query() {
        Some(q) => format!("{path}?{q}"),
        None => path.to_string(),
    };

    let mut parts = uri.clone().into_parts();
    parts.path_and_query = Some(
        path_and_query
            .parse()
            .map_err(|e: http::uri::InvalidUri| FilterError::PathRewrite(e.to_string()))?,
    );
    *req.uri_mut() = Uri::from_parts(parts).map_err(|e| FilterError::PathRewrite(e.to_string()))?;
    Ok(())
}
