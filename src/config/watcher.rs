//! Configuration file watcher for hot reload.
//!
//! Edits to the config file on disk are funneled through the same reload
//! path the control-plane API uses, so a hand-edited file and an API call
//! behave identically.

use crate::collector::CollectorService;
use crate::config::load_config;
use notify::{Event, RecursiveMode, Watcher};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

/// Delay between the first change event and the reload, so editors that
/// write in multiple steps (truncate + write + rename) settle first.
const DEBOUNCE: Duration = Duration::from_millis(400);

/// Watches a configuration file for changes and triggers reloads.
pub struct ConfigWatcher {
    path: PathBuf,
    service: Arc<CollectorService>,
}

impl ConfigWatcher {
    /// Create a new configuration watcher.
    pub fn new(path: PathBuf, service: Arc<CollectorService>) -> Self {
        Self { path, service }
    }

    /// Watch the file until shutdown, reloading on change.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();

        let mut watcher = match notify::recommended_watcher(move |res: notify::Result<Event>| {
            match res {
                Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                    let _ = tx.send(());
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "config watch error"),
            }
        }) {
            Ok(w) => w,
            Err(e) => {
                error!(error = %e, "failed to create config watcher");
                return;
            }
        };

        // Watch the parent directory: editors often replace the file, which
        // drops a watch registered on the file itself.
        let watch_target = self
            .path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| self.path.clone());
        if let Err(e) = watcher.watch(&watch_target, RecursiveMode::NonRecursive) {
            error!(error = %e, path = %watch_target.display(), "failed to watch config path");
            return;
        }

        info!(path = %self.path.display(), "config watcher started");

        loop {
            tokio::select! {
                event = rx.recv() => {
                    if event.is_none() {
                        break;
                    }
                    tokio::time::sleep(DEBOUNCE).await;
                    while rx.try_recv().is_ok() {}

                    self.reload_from_disk().await;
                }

                _ = shutdown.recv() => {
                    info!("config watcher shutting down");
                    break;
                }
            }
        }
    }

    async fn reload_from_disk(&self) {
        let config = match load_config(&self.path) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, path = %self.path.display(),
                      "ignoring config change, file does not validate");
                return;
            }
        };

        if config == *self.service.current_config() {
            debug!("config file changed but content is unchanged, skipping reload");
            return;
        }

        match self.service.reload(config).await {
            Ok(summary) => {
                info!(
                    added = summary.added.len(),
                    removed = summary.removed.len(),
                    "config reloaded from file"
                );
            }
            Err(e) => error!(error = %e, "reload from file failed, previous config still active"),
        }
    }
}
