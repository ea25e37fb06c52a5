//! Configuration version history and rollback.
//!
//! Every accepted configuration is recorded with a monotonically increasing
//! version number and a sha256 content hash. History is bounded; rollback
//! republishes the previous entry's config as a brand-new version so the
//! numbering stays monotonic.
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::config::models::Config;

/// One saved configuration version.
#[derive(Clone)]
pub struct ConfigVersion {
    pub version: u64,
    pub hash: String,
    pub timestamp: DateTime<Utc>,
    pub config: Arc<Config>,
}

const DEFAULT_MAX_HISTORY: usize = 10;

struct VersionHistory {
    versions: Vec<ConfigVersion>,
    next_version: u64,
}

/// Bounded version history with rollback support.
pub struct VersionManager {
    inner: Mutex<VersionHistory>,
    max_history: usize,
}

impl VersionManager {
    /// Create a manager keeping at most `max_history` entries (0 means the
    /// default of 10).
    pub fn new(max_history: usize) -> Self {
        let max_history = if max_history == 0 {
            DEFAULT_MAX_HISTORY
        } else {
            max_history
        };
        Self {
            inner: Mutex::new(VersionHistory {
                versions: Vec::new(),
                next_version: 0,
            }),
            max_history,
        }
    }

    /// Record a new configuration version, hashing `raw` for change
    /// detection. Returns the assigned version number.
    pub fn save(&self, config: Arc<Config>, raw: &[u8]) -> u64 {
        let hash = format!("{:x}", Sha256::digest(raw));
        let mut inner = self.inner.lock().expect("version history poisoned");
        inner.next_version += 1;
        let version = inner.next_version;

        inner.versions.push(ConfigVersion {
            version,
            hash,
            timestamp: Utc::now(),
            config,
        });
        Self::truncate(&mut inner.versions, self.max_history);
        version
    }

    /// The latest version, if any configuration has been recorded.
    pub fn current(&self) -> Option<ConfigVersion> {
        let inner = self.inner.lock().expect("version history poisoned");
        inner.versions.last().cloned()
    }

    /// A copy of the stored history, oldest first.
    pub fn list(&self) -> Vec<ConfigVersion> {
        let inner = self.inner.lock().expect("version history poisoned");
        inner.versions.clone()
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().expect("version history poisoned");
        inner.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Roll back to the previous version. The previous entry's config is
    /// re-recorded as a new version (same hash, fresh number) and returned.
    pub fn rollback(&self) -> Option<ConfigVersion> {
        let mut inner = self.inner.lock().expect("version history poisoned");
        if inner.versions.len() < 2 {
            return None;
        }

        let previous = inner.versions[inner.versions.len() - 2].clone();
        inner.next_version += 1;
        let version = inner.next_version;

        let entry = ConfigVersion {
            version,
            hash: previous.hash.clone(),
            timestamp: Utc::now(),
            config: Arc::clone(&previous.config),
        };
        inner.versions.push(entry.clone());
        Self::truncate(&mut inner.versions, self.max_history);
        Some(entry)
    }

    fn truncate(versions: &mut Vec<ConfigVersion>, max: usize) {
        if versions.len() > max {
            let excess = versions.len() - max;
            versions.drain(..excess);
        }
    }
}
