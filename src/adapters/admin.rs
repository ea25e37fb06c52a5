//! Admin API.
//!
//! JSON over HTTP on the admin listener: read the live config, list and roll
//! back versions, publish/update/delete routes, manage API documentation,
//! and expose Prometheus metrics. Every mutation goes through the Config
//! Center so the data plane sees it as an ordinary snapshot swap.
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    config::{
        center::{AdminOpError, ConfigCenter},
        models::Route,
    },
    metrics,
};

/// Documentation for a published API route.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ApiDoc {
    pub route_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub deprecated: bool,
    #[serde(default)]
    pub published_at: String,
    #[serde(default)]
    pub updated_at: String,
}

/// In-memory store for route documentation.
#[derive(Default)]
pub struct DocStore {
    docs: RwLock<HashMap<String, ApiDoc>>,
}

impl DocStore {
    pub fn get(&self, route_name: &str) -> Option<ApiDoc> {
        self.docs.read().expect("doc store poisoned").get(route_name).cloned()
    }

    pub fn set(&self, doc: ApiDoc) {
        self.docs
            .write()
            .expect("doc store poisoned")
            .insert(doc.route_name.clone(), doc);
    }

    pub fn delete(&self, route_name: &str) -> bool {
        self.docs
            .write()
            .expect("doc store poisoned")
            .remove(route_name)
            .is_some()
    }

    pub fn list(&self) -> Vec<ApiDoc> {
        let mut docs: Vec<ApiDoc> = self
            .docs
            .read()
            .expect("doc store poisoned")
            .values()
            .cloned()
            .collect();
        docs.sort_by(|a, b| a.route_name.cmp(&b.route_name));
        docs
    }
}

#[derive(Clone)]
struct AdminState {
    center: Arc<ConfigCenter>,
    docs: Arc<DocStore>,
}

/// Build the admin router.
pub fn router(center: Arc<ConfigCenter>) -> Router {
    let state = AdminState {
        center,
        docs: Arc::new(DocStore::default()),
    };

    Router::new()
        .route("/api/v1/config", get(get_config))
        .route("/api/v1/config/versions", get(list_versions))
        .route("/api/v1/config/rollback", post(rollback_config))
        .route("/api/v1/routes", get(list_routes).post(publish_route))
        .route(
            "/api/v1/routes/{name}",
            axum::routing::put(update_route).delete(delete_route),
        )
        .route("/api/v1/upstreams", get(list_upstreams))
        .route("/api/v1/status", get(get_status))
        .route("/api/v1/docs", get(list_docs).post(publish_doc))
        .route("/api/v1/docs/{route}", get(get_doc).delete(delete_doc))
        .route("/metrics", get(render_metrics))
        .with_state(state)
}

fn op_error(err: AdminOpError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match &err {
        AdminOpError::NoConfig => StatusCode::SERVICE_UNAVAILABLE,
        AdminOpError::DuplicateRoute(_) => StatusCode::CONFLICT,
        AdminOpError::RouteNotFound(_) => StatusCode::NOT_FOUND,
        AdminOpError::NoPreviousVersion | AdminOpError::Rejected(_) => StatusCode::BAD_REQUEST,
    };
    (status, Json(json!({ "error": err.to_string() })))
}

async fn get_config(State(state): State<AdminState>) -> impl IntoResponse {
    match state.center.current_config() {
        Some(config) => (StatusCode::OK, Json(json!(&*config))),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "no configuration loaded" })),
        ),
    }
}

async fn list_versions(State(state): State<AdminState>) -> impl IntoResponse {
    let versions: Vec<serde_json::Value> = state
        .center
        .versions()
        .iter()
        .map(|v| {
            json!({
                "version": v.version,
                "hash": v.hash,
                "timestamp": v.timestamp.to_rfc3339(),
            })
        })
        .collect();
    (StatusCode::OK, Json(json!(versions)))
}

async fn rollback_config(State(state): State<AdminState>) -> impl IntoResponse {
    match state.center.rollback() {
        Ok(version) => (
            StatusCode::OK,
            Json(json!({
                "message": "configuration rolled back successfully",
                "version": version,
            })),
        ),
        Err(err) => op_error(err),
    }
}

async fn list_routes(State(state): State<AdminState>) -> impl IntoResponse {
    match state.center.current_config() {
        Some(config) => (StatusCode::OK, Json(json!(config.routes))),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "no configuration loaded" })),
        ),
    }
}

async fn publish_route(
    State(state): State<AdminState>,
    Json(route): Json<Route>,
) -> impl IntoResponse {
    if let Err(message) = check_route_body(&route) {
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": message })));
    }
    let name = route.name.clone();
    match state.center.publish_route(route) {
        Ok(_) => (
            StatusCode::CREATED,
            Json(json!({
                "message": "route published successfully",
                "name": name,
            })),
        ),
        Err(err) => op_error(err),
    }
}

async fn update_route(
    State(state): State<AdminState>,
    Path(name): Path<String>,
    Json(route): Json<Route>,
) -> impl IntoResponse {
    if route.upstream.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "route upstream is required" })),
        );
    }
    if route.paths.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "route must have at least one path rule" })),
        );
    }
    match state.center.update_route(&name, route) {
        Ok(_) => (
            StatusCode::OK,
            Json(json!({
                "message": "route updated successfully",
                "name": name,
            })),
        ),
        Err(err) => op_error(err),
    }
}

async fn delete_route(
    State(state): State<AdminState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.center.delete_route(&name) {
        Ok(_) => (
            StatusCode::OK,
            Json(json!({
                "message": "route unpublished successfully",
                "name": name,
            })),
        ),
        Err(err) => op_error(err),
    }
}

fn check_route_body(route: &Route) -> Result<(), &'static str> {
    if route.name.is_empty() {
        return Err("route name is required");
    }
    if route.upstream.is_empty() {
        return Err("route upstream is required");
    }
    if route.paths.is_empty() {
        return Err("route must have at least one path rule");
    }
    Ok(())
}

async fn list_upstreams(State(state): State<AdminState>) -> impl IntoResponse {
    match state.center.current_config() {
        Some(config) => (
            StatusCode::OK,
            Json(json!({
                "upstreams": config.upstreams,
                "clusters": config.clusters,
            })),
        ),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "no configuration loaded" })),
        ),
    }
}

async fn get_status(State(state): State<AdminState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "running",
            "config_versions": state.center.version_count(),
        })),
    )
}

async fn publish_doc(
    State(state): State<AdminState>,
    Json(mut doc): Json<ApiDoc>,
) -> impl IntoResponse {
    if doc.route_name.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "route_name is required" })),
        );
    }

    let now = Utc::now().to_rfc3339();
    match state.docs.get(&doc.route_name) {
        Some(existing) => {
            doc.published_at = existing.published_at;
            doc.updated_at = now;
        }
        None => {
            doc.published_at = now.clone();
            doc.updated_at = now;
        }
    }
    let route_name = doc.route_name.clone();
    state.docs.set(doc);

    (
        StatusCode::CREATED,
        Json(json!({
            "message": "documentation published successfully",
            "route_name": route_name,
        })),
    )
}

async fn list_docs(State(state): State<AdminState>) -> impl IntoResponse {
    (StatusCode::OK, Json(json!(state.docs.list())))
}

async fn get_doc(
    State(state): State<AdminState>,
    Path(route): Path<String>,
) -> impl IntoResponse {
    match state.docs.get(&route) {
        Some(doc) => (StatusCode::OK, Json(json!(doc))),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({
                "error": format!("documentation for route '{route}' not found"),
            })),
        ),
    }
}

async fn delete_doc(
    State(state): State<AdminState>,
    Path(route): Path<String>,
) -> impl IntoResponse {
    if state.docs.delete(&route) {
        (
            StatusCode::OK,
            Json(json!({
                "message": "documentation unpublished successfully",
                "route_name": route,
            })),
        )
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({
                "error": format!("documentation for route '{route}' not found"),
            })),
        )
    }
}

async fn render_metrics() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        metrics::render(),
    )
}
