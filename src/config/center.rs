//! The Config Center: validation, compilation, versioning, and atomic
//! publication of snapshots.
//!
//! All writes to the snapshot pointer funnel through here — the initial load,
//! file-watcher reloads, admin route mutations, and rollback. A failure at
//! any step leaves the currently published snapshot untouched and is counted
//! in `nexus_config_reloads_total{result="failure"}`.
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use arc_swap::ArcSwapOption;
use eyre::{WrapErr, eyre};
use thiserror::Error;

use crate::{
    config::{
        loader,
        models::{Config, Route},
        validation::ConfigValidator,
        version::{ConfigVersion, VersionManager},
    },
    core::{SnapshotStore, compiler},
    metrics,
};

/// Errors surfaced to the admin API with distinct status codes.
#[derive(Debug, Error)]
pub enum AdminOpError {
    #[error("no configuration loaded")]
    NoConfig,
    #[error("route with name '{0}' already exists")]
    DuplicateRoute(String),
    #[error("route '{0}' not found")]
    RouteNotFound(String),
    #[error("no previous version to rollback to")]
    NoPreviousVersion,
    #[error(transparent)]
    Rejected(#[from] eyre::Report),
}

/// Owns the declarative config lifecycle and the snapshot pointer.
pub struct ConfigCenter {
    store: Arc<SnapshotStore>,
    versions: VersionManager,
    current: ArcSwapOption<Config>,
    snapshot_version: AtomicU64,
}

impl ConfigCenter {
    pub fn new(store: Arc<SnapshotStore>) -> Self {
        Self {
            store,
            versions: VersionManager::new(0),
            current: ArcSwapOption::empty(),
            snapshot_version: AtomicU64::new(0),
        }
    }

    pub fn snapshot_store(&self) -> &Arc<SnapshotStore> {
        &self.store
    }

    /// The currently published declarative config, if any.
    pub fn current_config(&self) -> Option<Arc<Config>> {
        self.current.load_full()
    }

    pub fn versions(&self) -> Vec<ConfigVersion> {
        self.versions.list()
    }

    pub fn version_count(&self) -> usize {
        self.versions.len()
    }

    /// Validate, compile, and atomically publish `config`, recording it in
    /// the version history. Returns the new config version number.
    pub fn publish(&self, config: Config, raw: &[u8]) -> eyre::Result<u64> {
        match self.try_publish(config, raw) {
            Ok(version) => {
                metrics::record_config_reload(true);
                Ok(version)
            }
            Err(e) => {
                metrics::record_config_reload(false);
                Err(e)
            }
        }
    }

    fn try_publish(&self, config: Config, raw: &[u8]) -> eyre::Result<u64> {
        ConfigValidator::validate(&config).map_err(|e| eyre!("{e}"))?;

        let prev = self.store.load();
        let snapshot_version = self.snapshot_version.fetch_add(1, Ordering::Relaxed) + 1;
        let snapshot = compiler::compile(&config, prev.as_deref(), snapshot_version)
            .wrap_err("failed to compile configuration")?;

        // Publication order: snapshot first, then the declarative view. The
        // data plane only ever reads the snapshot.
        self.store.store(Arc::new(snapshot));
        let config = Arc::new(config);
        self.current.store(Some(Arc::clone(&config)));
        let version = self.versions.save(config, raw);

        tracing::info!(version, snapshot_version, "configuration published");
        Ok(version)
    }

    /// Load, validate, and publish the config file at `path`.
    pub async fn load_from_file(&self, path: &str) -> eyre::Result<u64> {
        let raw = tokio::fs::read(path)
            .await
            .wrap_err_with(|| format!("failed to read config file {path}"))?;
        let config = loader::load_config(path).await?;
        self.publish(config, &raw)
    }

    /// Roll back to the previous version: the prior config is re-recorded as
    /// a new version and re-published.
    pub fn rollback(&self) -> Result<u64, AdminOpError> {
        let entry = self
            .versions
            .rollback()
            .ok_or(AdminOpError::NoPreviousVersion)?;

        let prev = self.store.load();
        let snapshot_version = self.snapshot_version.fetch_add(1, Ordering::Relaxed) + 1;
        let snapshot = compiler::compile(&entry.config, prev.as_deref(), snapshot_version)
            .wrap_err("failed to compile rolled-back configuration")?;

        self.store.store(Arc::new(snapshot));
        self.current.store(Some(Arc::clone(&entry.config)));
        metrics::record_config_reload(true);

        tracing::info!(version = entry.version, "configuration rolled back");
        Ok(entry.version)
    }

    /// Admin publish of a single route. Fails on duplicate names.
    pub fn publish_route(&self, route: Route) -> Result<u64, AdminOpError> {
        let current = self.current_config().ok_or(AdminOpError::NoConfig)?;
        if current.routes.iter().any(|r| r.name == route.name) {
            return Err(AdminOpError::DuplicateRoute(route.name));
        }

        let mut config = (*current).clone();
        config.routes.push(route);
        self.publish_mutation(config)
    }

    /// Admin update of an existing route by name.
    pub fn update_route(&self, name: &str, mut route: Route) -> Result<u64, AdminOpError> {
        let current = self.current_config().ok_or(AdminOpError::NoConfig)?;
        route.name = name.to_string();

        let mut config = (*current).clone();
        let slot = config
            .routes
            .iter_mut()
            .find(|r| r.name == name)
            .ok_or_else(|| AdminOpError::RouteNotFound(name.to_string()))?;
        *slot = route;
        self.publish_mutation(config)
    }

    /// Admin removal of a route by name.
    pub fn delete_route(&self, name: &str) -> Result<u64, AdminOpError> {
        let current = self.current_config().ok_or(AdminOpError::NoConfig)?;
        let mut config = (*current).clone();
        let before = config.routes.len();
        config.routes.retain(|r| r.name != name);
        if config.routes.len() == before {
            return Err(AdminOpError::RouteNotFound(name.to_string()));
        }
        self.publish_mutation(config)
    }

    fn publish_mutation(&self, config: Config) -> Result<u64, AdminOpError> {
        let raw = serde_json::to_vec(&config).unwrap_or_default();
        Ok(self.publish(config, &raw)?)
    }
}
