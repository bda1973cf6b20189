//! Config hot-reload via filesystem watcher.
//!
//! Watches the config file and re-parses on change, broadcasting
//! `ConfigChange` events via a tokio broadcast channel. Only the `rate_limit`
//! section is applied to a running node; everything else needs a restart.

use std::path::PathBuf;
use std::sync::Arc;

use notify::{EventKind, RecursiveMode, Watcher};
use tokio::sync::{RwLock, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use collab_relay_core::config::{Config, RateLimitConfigPatch};

use crate::rate_limit::RateLimiter;

/// A config change event.
#[derive(Debug, Clone)]
pub struct ConfigChange {
    pub new_config: Arc<Config>,
}

/// Watches the config file and emits change events.
pub struct ConfigWatcher {
    pub config: Arc<RwLock<Config>>,
    change_tx: broadcast::Sender<ConfigChange>,
    _watcher: notify::RecommendedWatcher,
}

impl ConfigWatcher {
    /// Start watching the config file at `config_path`.
    /// Returns the watcher and a receiver for config change events.
    pub fn start(
        config_path: PathBuf,
        initial_config: Config,
    ) -> anyhow::Result<(Self, broadcast::Receiver<ConfigChange>)> {
        let config = Arc::new(RwLock::new(initial_config));
        let (change_tx, change_rx) = broadcast::channel(16);

        let config_clone = config.clone();
        let tx_clone = change_tx.clone();
        let path_clone = config_path.clone();
        let file_name = config_path.file_name().map(|n| n.to_os_string());

        let mut watcher =
            notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
                let event = match res {
                    Ok(event) => event,
                    Err(e) => {
                        error!(%e, "Config file watch error");
                        return;
                    }
                };
                if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                    return;
                }
                // The parent directory is watched; ignore siblings.
                if !event
                    .paths
                    .iter()
                    .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name)
                {
                    return;
                }
                debug!("Config file changed, reloading");
                match Config::load(&path_clone) {
                    Ok(new_config) => {
                        let new_config = Arc::new(new_config);
                        // Sync callback: no await available.
                        if let Ok(mut guard) = config_clone.try_write() {
                            *guard = (*new_config).clone();
                            let _ = tx_clone.send(ConfigChange { new_config });
                            info!("Config reloaded successfully");
                        } else {
                            warn!("Could not acquire config write lock during reload");
                        }
                    }
                    Err(e) => {
                        error!(%e, "Failed to reload config");
                    }
                }
            })?;

        // Watch the parent directory to catch editors that replace the file.
        let watch_path = config_path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));

        watcher.watch(&watch_path, RecursiveMode::NonRecursive)?;
        info!(path = %config_path.display(), "Config file watcher started");

        Ok((
            Self {
                config,
                change_tx,
                _watcher: watcher,
            },
            change_rx,
        ))
    }

    /// Subscribe to config change events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConfigChange> {
        self.change_tx.subscribe()
    }

    /// Get the current config (read lock).
    pub async fn current_config(&self) -> Config {
        self.config.read().await.clone()
    }
}

/// Push the `rate_limit` section of each reloaded config into the running
/// limiter. An invalid section is logged and the limiter keeps its config.
pub fn apply_rate_limit_changes(
    mut rx: broadcast::Receiver<ConfigChange>,
    limiter: Arc<RateLimiter>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let change = tokio::select! {
                _ = cancel.cancelled() => break,
                change = rx.recv() => change,
            };
            match change {
                Ok(change) => {
                    let section = change.new_config.rate_limit();
                    let current = limiter.get_config().await;
                    if section.key_prefix != current.key_prefix {
                        warn!(
                            current = %current.key_prefix,
                            requested = %section.key_prefix,
                            "rate_limit.key_prefix cannot change at runtime; ignoring it"
                        );
                    }
                    let patch = RateLimitConfigPatch::from(&section);
                    if let Err(e) = limiter.update_config(&patch).await {
                        warn!(%e, "Rejected reloaded rate limit config");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Config change receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
