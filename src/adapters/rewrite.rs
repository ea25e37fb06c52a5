//! Protocol-specific request rewriting.
//!
//! The protocol adapter turns a matched inbound request into the outbound
//! form the upstream expects: optional path/header rewriting for HTTP,
//! length-prefixed gRPC framing for gRPC upstreams, and a JSON invocation
//! envelope for Dubbo. Only the transcoders buffer the body, and the gRPC
//! path bounds the read by cluster config.
use axum::body::Body;
use http::{HeaderName, HeaderValue, Method, Request, header};
use http_body_util::{BodyExt, Limited};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::{
    config::models::{HeaderRewrite, RewriteRule},
    core::{
        filter,
        snapshot::{DubboTarget, GrpcTarget},
    },
};

/// Default bound on bodies collected for transcoding when the cluster does
/// not configure one (4 MiB, matching common gRPC defaults).
pub const DEFAULT_MAX_TRANSCODE_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum RewriteError {
    #[error("failed to read request body: {0}")]
    BodyRead(String),

    #[error("request body exceeds the {limit}-byte transcoding limit")]
    BodyTooLarge { limit: usize },

    #[error("failed to encode invocation: {0}")]
    Encode(String),

    #[error(transparent)]
    Path(#[from] filter::FilterError),
}

/// Apply HTTP-level rewriting: matched-prefix replacement then header
/// operations. A missing or empty prefix leaves the path untouched.
pub fn apply_http_rewrite(
    req: &mut Request<Body>,
    rewrite: &RewriteRule,
    matched_path: &str,
) -> Result<(), RewriteError> {
    if let Some(path_rewrite) = &rewrite.path_rewrite {
        if !path_rewrite.prefix.is_empty() && !matched_path.is_empty() {
            let original = req.uri().path().to_string();
            if let Some(rest) = original.strip_prefix(matched_path) {
                let mut new_path = format!("{}{}", path_rewrite.prefix, rest);
                if new_path.is_empty() {
                    new_path.push('/');
                }
                filter::set_request_path(req, &new_path)?;
            }
        }
    }

    if let Some(headers) = &rewrite.headers {
        apply_header_rewrite(req, headers);
    }
    Ok(())
}

/// Apply header manipulation in Add (append) → Set (overwrite) → Remove
/// order. Invalid names or values are skipped with a warning.
pub fn apply_header_rewrite(req: &mut Request<Body>, rewrite: &HeaderRewrite) {
    for (key, value) in &rewrite.add {
        match parse_header(key, value) {
            Some((name, value)) => {
                req.headers_mut().append(name, value);
            }
            None => tracing::warn!(%key, "skipping invalid header add"),
        }
    }
    for (key, value) in &rewrite.set {
        match parse_header(key, value) {
            Some((name, value)) => {
                req.headers_mut().insert(name, value);
            }
            None => tracing::warn!(%key, "skipping invalid header set"),
        }
    }
    for key in &rewrite.remove {
        if let Ok(name) = key.parse::<HeaderName>() {
            req.headers_mut().remove(name);
        }
    }
}

fn parse_header(key: &str, value: &str) -> Option<(HeaderName, HeaderValue)> {
    let name = key.parse::<HeaderName>().ok()?;
    let value = HeaderValue::from_str(value).ok()?;
    Some((name, value))
}

/// Rewrite a request for a gRPC upstream: `/<service>/<method>` path,
/// `application/grpc+json` content type, HTTP/2 with `TE: trailers`, and the
/// body wrapped in gRPC length-prefixed framing (one zero byte for
/// "uncompressed", a big-endian u32 message length, then the JSON payload).
pub async fn apply_grpc_rewrite(
    req: Request<Body>,
    target: &GrpcTarget,
    max_bytes: usize,
) -> Result<Request<Body>, RewriteError> {
    let (mut parts, body) = req.into_parts();

    let payload = collect_body(body, max_bytes).await?;

    let mut framed = Vec::with_capacity(payload.len() + 5);
    framed.push(0); // not compressed
    framed.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    framed.extend_from_slice(&payload);

    parts.version = http::Version::HTTP_2;
    parts.uri = rebuild_uri(&parts.uri, &format!("/{}/{}", target.service, target.method))?;
    parts.headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/grpc+json"),
    );
    parts
        .headers
        .insert(header::TE, HeaderValue::from_static("trailers"));
    parts.headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from(framed.len() as u64),
    );

    Ok(Request::from_parts(parts, Body::from(framed)))
}

/// A simplified Dubbo invocation encoded as JSON for a triple-protocol
/// endpoint or Dubbo gateway.
#[derive(Debug, Serialize)]
struct DubboInvocation<'a> {
    interface: &'a str,
    method: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    param_types: Vec<&'a str>,
    args: Value,
}

/// Rewrite a request for a Dubbo upstream. The inbound body becomes the
/// invocation arguments: parsed as JSON when valid, carried as a raw string
/// otherwise.
pub async fn apply_dubbo_rewrite(
    req: Request<Body>,
    target: &DubboTarget,
    max_bytes: usize,
) -> Result<Request<Body>, RewriteError> {
    let (mut parts, body) = req.into_parts();

    let payload = collect_body(body, max_bytes).await?;
    let args = if payload.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&payload).unwrap_or_else(|_| {
            Value::String(String::from_utf8_lossy(&payload).into_owned())
        })
    };

    let invocation = DubboInvocation {
        interface: &target.interface,
        method: &target.method,
        param_types: target.param_types.iter().map(String::as_str).collect(),
        args,
    };
    let encoded =
        serde_json::to_vec(&invocation).map_err(|e| RewriteError::Encode(e.to_string()))?;

    parts.method = Method::POST;
    parts.uri = rebuild_uri(&parts.uri, &format!("/{}/{}", target.interface, target.method))?;
    parts.headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    parts.headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from(encoded.len() as u64),
    );
    if !target.group.is_empty() {
        if let Ok(v) = HeaderValue::from_str(&target.group) {
            parts.headers.insert("dubbo-group", v);
        }
    }
    if !target.version.is_empty() {
        if let Ok(v) = HeaderValue::from_str(&target.version) {
            parts.headers.insert("dubbo-version", v);
        }
    }

    Ok(Request::from_parts(parts, Body::from(encoded)))
}

async fn collect_body(body: Body, max_bytes: usize) -> Result<Vec<u8>, RewriteError> {
    let limited = Limited::new(body, max_bytes);
    match limited.collect().await {
        Ok(collected) => Ok(collected.to_bytes().to_vec()),
        Err(e) => {
            if e.downcast_ref::<http_body_util::LengthLimitError>().is_some() {
                Err(RewriteError::BodyTooLarge { limit: max_bytes })
            } else {
                Err(RewriteError::BodyRead(e.to_string()))
            }
        }
    }
}

fn rebuild_uri(uri: &http::Uri, path: &str) -> Result<http::Uri, RewriteError> {
    let path_and_query = match uri.query() {
        Some(q) => format!("{path}?{q}"),
        None => path.to_string(),
    };
    let mut parts = uri.clone().into_parts();
    parts.path_and_query = Some(
        path_and_query
            .parse()
            .map_err(|e: http::uri::InvalidUri| RewriteError::Encode(e.to_string()))?,
    );
    http::Uri::from_parts(parts).map_err(|e| RewriteError::Encode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use http::Version;

    use super::*;
    use crate::config::models::PathRewrite;

    fn request(method: Method, uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_bytes(req: Request<Body>) -> Vec<u8> {
        req.into_body().collect().await.unwrap().to_bytes().to_vec()
    }

    #[test]
    fn http_prefix_rewrite_replaces_matched_segment() {
        let rewrite = RewriteRule {
            path_rewrite: Some(PathRewrite {
                prefix: "/internal/v2".to_string(),
            }),
            ..Default::default()
        };
        let mut req = request(Method::GET, "/api/users?id=7", "");
        apply_http_rewrite(&mut req, &rewrite, "/api").unwrap();
        assert_eq!(req.uri().path(), "/internal/v2/users");
        assert_eq!(req.uri().query(), Some("id=7"));
    }

    #[test]
    fn empty_prefix_rewrite_is_a_no_op() {
        let rewrite = RewriteRule {
            path_rewrite: Some(PathRewrite::default()),
            ..Default::default()
        };
        let mut req = request(Method::GET, "/api/users", "");
        apply_http_rewrite(&mut req, &rewrite, "/api").unwrap();
        assert_eq!(req.uri().path(), "/api/users");
    }

    #[test]
    fn null_rewrite_leaves_request_unchanged() {
        let rewrite = RewriteRule::default();
        let mut req = request(Method::GET, "/api/users", "");
        req.headers_mut()
            .insert("x-keep", HeaderValue::from_static("1"));

        apply_http_rewrite(&mut req, &rewrite, "/api").unwrap();
        assert_eq!(req.uri().path(), "/api/users");
        assert_eq!(req.headers().get("x-keep").unwrap(), "1");
        assert_eq!(req.headers().len(), 1);
    }

    #[test]
    fn header_operations_apply_in_add_set_remove_order() {
        let mut rewrite = HeaderRewrite::default();
        rewrite.add.insert("x-trace".to_string(), "a".to_string());
        rewrite.set.insert("x-env".to_string(), "prod".to_string());
        rewrite.remove.push("x-secret".to_string());

        let mut req = request(Method::GET, "/", "");
        req.headers_mut()
            .insert("x-trace", HeaderValue::from_static("existing"));
        req.headers_mut()
            .insert("x-env", HeaderValue::from_static("dev"));
        req.headers_mut()
            .insert("x-secret", HeaderValue::from_static("hunter2"));

        apply_header_rewrite(&mut req, &rewrite);

        // Add appends alongside the existing value.
        let traces: Vec<_> = req.headers().get_all("x-trace").iter().collect();
        assert_eq!(traces.len(), 2);
        // Set overwrites.
        assert_eq!(req.headers().get("x-env").unwrap(), "prod");
        // Remove deletes.
        assert!(req.headers().get("x-secret").is_none());
    }

    #[tokio::test]
    async fn grpc_rewrite_frames_the_body() {
        let target = GrpcTarget {
            service: "helloworld.Greeter".to_string(),
            method: "SayHello".to_string(),
        };
        let req = request(Method::POST, "http://gw/api/hello", r#"{"name":"world"}"#);

        let out = apply_grpc_rewrite(req, &target, DEFAULT_MAX_TRANSCODE_BYTES)
            .await
            .unwrap();

        assert_eq!(out.uri().path(), "/helloworld.Greeter/SayHello");
        assert_eq!(out.version(), Version::HTTP_2);
        assert_eq!(
            out.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/grpc+json"
        );
        assert_eq!(out.headers().get(header::TE).unwrap(), "trailers");
        assert_eq!(out.headers().get(header::CONTENT_LENGTH).unwrap(), "22");

        let bytes = body_bytes(out).await;
        assert_eq!(bytes.len(), 22);
        assert_eq!(bytes[0], 0x00);
        assert_eq!(&bytes[1..5], &0x00000011u32.to_be_bytes());
        assert_eq!(&bytes[5..], br#"{"name":"world"}"#);
    }

    #[tokio::test]
    async fn grpc_framing_round_trips() {
        let target = GrpcTarget {
            service: "pkg.Svc".to_string(),
            method: "Call".to_string(),
        };
        let payload = r#"{"k":[1,2,3]}"#;
        let req = request(Method::POST, "/x", payload);

        let out = apply_grpc_rewrite(req, &target, DEFAULT_MAX_TRANSCODE_BYTES)
            .await
            .unwrap();
        let bytes = body_bytes(out).await;

        let len = u32::from_be_bytes(bytes[1..5].try_into().unwrap()) as usize;
        assert_eq!(len, payload.len());
        assert_eq!(&bytes[5..], payload.as_bytes());
    }

    #[tokio::test]
    async fn grpc_rewrite_enforces_body_bound() {
        let target = GrpcTarget {
            service: "pkg.Svc".to_string(),
            method: "Call".to_string(),
        };
        let req = request(Method::POST, "/x", &"a".repeat(64));

        let err = apply_grpc_rewrite(req, &target, 16).await.unwrap_err();
        assert!(matches!(err, RewriteError::BodyTooLarge { limit: 16 }));
    }

    #[tokio::test]
    async fn dubbo_rewrite_builds_json_envelope() {
        let target = DubboTarget {
            interface: "com.example.UserService".to_string(),
            method: "getUser".to_string(),
            param_types: vec!["java.lang.Long".to_string()],
            group: "prod".to_string(),
            version: "1.0.0".to_string(),
        };
        let req = request(Method::GET, "/api/users/7", r#"{"id":7}"#);

        let out = apply_dubbo_rewrite(req, &target, DEFAULT_MAX_TRANSCODE_BYTES)
            .await
            .unwrap();

        assert_eq!(out.method(), Method::POST);
        assert_eq!(out.uri().path(), "/com.example.UserService/getUser");
        assert_eq!(
            out.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
        assert_eq!(out.headers().get("dubbo-group").unwrap(), "prod");
        assert_eq!(out.headers().get("dubbo-version").unwrap(), "1.0.0");

        let envelope: Value = serde_json::from_slice(&body_bytes(out).await).unwrap();
        assert_eq!(envelope["interface"], "com.example.UserService");
        assert_eq!(envelope["method"], "getUser");
        assert_eq!(envelope["param_types"][0], "java.lang.Long");
        assert_eq!(envelope["args"]["id"], 7);
    }

    #[tokio::test]
    async fn dubbo_rewrite_passes_non_json_body_as_string() {
        let target = DubboTarget {
            interface: "com.example.Echo".to_string(),
            method: "say".to_string(),
            param_types: Vec::new(),
            group: String::new(),
            version: String::new(),
        };
        let req = request(Method::POST, "/echo", "plain text");

        let out = apply_dubbo_rewrite(req, &target, DEFAULT_MAX_TRANSCODE_BYTES)
            .await
            .unwrap();
        assert!(out.headers().get("dubbo-group").is_none());

        let envelope: Value = serde_json::from_slice(&body_bytes(out).await).unwrap();
        assert_eq!(envelope["args"], "plain text");
        // Empty param_types is omitted from the envelope entirely.
        assert!(envelope.get("param_types").is_none());
    }

    #[tokio::test]
    async fn dubbo_rewrite_with_empty_body_sends_null_args() {
        let target = DubboTarget {
            interface: "com.example.Ping".to_string(),
            method: "ping".to_string(),
            param_types: Vec::new(),
            group: String::new(),
            version: String::new(),
        };
        let req = request(Method::GET, "/ping", "");

        let out = apply_dubbo_rewrite(req, &target, DEFAULT_MAX_TRANSCODE_BYTES)
            .await
            .unwrap();
        let envelope: Value = serde_json::from_slice(&body_bytes(out).await).unwrap();
        assert!(envelope["args"].is_null());
    }
}
