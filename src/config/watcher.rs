//! Config file change watching.
//!
//! A `notify` watcher on the config file's directory feeds a small mpsc
//! channel; the reload task debounces and re-reads. Watching the directory
//! rather than the file survives editors and orchestrators that replace the
//! file atomically.
use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use notify::{RecursiveMode, Watcher};
use tokio::sync::mpsc;

/// Watches one configuration file for modification events.
pub struct ConfigWatcher {
    path: PathBuf,
    // The watcher must stay alive for events to keep flowing.
    _watcher: notify::RecommendedWatcher,
    rx: mpsc::Receiver<()>,
}

impl ConfigWatcher {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let (tx, rx) = mpsc::channel(1);

        let file_name = path
            .file_name()
            .ok_or_else(|| eyre::eyre!("Invalid config path: {}", path.display()))?
            .to_owned();

        let mut watcher =
            notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
                match res {
                    Ok(event) => {
                        let relevant = event.kind.is_modify()
                            || event.kind.is_create()
                            || event.kind.is_remove();
                        if relevant
                            && event
                                .paths
                                .iter()
                                .any(|p| p.file_name() == Some(file_name.as_os_str()))
                        {
                            tracing::debug!(kind = ?event.kind, "config file changed");
                            // Channel full means a reload is already pending.
                            let _ = tx.try_send(());
                        }
                    }
                    Err(e) => tracing::error!(error = ?e, "config watch error"),
                }
            })?;

        let watch_dir = path.parent().unwrap_or_else(|| Path::new("."));
        watcher
            .watch(watch_dir, RecursiveMode::NonRecursive)
            .wrap_err("Failed to watch config directory")?;

        Ok(Self {
            path,
            _watcher: watcher,
            rx,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait for the next change notification. Returns `None` once the
    /// watcher is gone.
    pub async fn changed(&mut self) -> Option<()> {
        self.rx.recv().await
    }

    /// Drop any queued notifications, collapsing bursts into one reload.
    pub fn drain(&mut self) {
        while self.rx.try_recv().is_ok() {}
    }
}
