//! Request authentication.
//!
//! Authentication strategies are a closed set enumerated in configuration.
//! Today that set is API keys; the enum keeps the seam explicit without an
//! open plugin registry.
use std::collections::HashMap;

use axum::body::Body;
use http::Request;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing API key")]
    MissingApiKey,
    #[error("invalid API key")]
    InvalidApiKey,
}

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub subject: String,
    /// Authentication source, e.g. "apikey".
    pub source: &'static str,
}

/// Closed set of authentication strategies.
pub enum Authenticator {
    ApiKey(ApiKeyAuthenticator),
}

impl Authenticator {
    pub fn authenticate(&self, req: &Request<Body>) -> Result<Identity, AuthError> {
        match self {
            Authenticator::ApiKey(a) => a.authenticate(req),
        }
    }
}

/// Validates requests against a static key → consumer-name mapping. The key
/// is taken from the `X-API-Key` header or, failing that, the `api_key`
/// query parameter.
pub struct ApiKeyAuthenticator {
    keys: HashMap<String, String>,
}

impl ApiKeyAuthenticator {
    pub fn new(keys: HashMap<String, String>) -> Self {
        Self { keys }
    }

    pub fn authenticate(&self, req: &Request<Body>) -> Result<Identity, AuthError> {
        let header_key = req
            .headers()
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .filter(|k| !k.is_empty());

        let key = match header_key {
            Some(k) => k.to_string(),
            None => query_param(req.uri().query(), "api_key").ok_or(AuthError::MissingApiKey)?,
        };

        match self.keys.get(&key) {
            Some(subject) => Ok(Identity {
                subject: subject.clone(),
                source: "apikey",
            }),
            None => Err(AuthError::InvalidApiKey),
        }
    }
}

fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    query?.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == name && !v.is_empty()).then(|| v.to_string())
    })
}
