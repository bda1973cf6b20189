//! Maintenance scheduler: periodic usage-counter cleanup.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use collab_relay_core::config::MaintenanceConfig;

use crate::rate_limit::RateLimiter;

/// A running maintenance loop.
pub struct MaintenanceScheduler {
    interval: Duration,
    retention_hours: u64,
    limiter: Arc<RateLimiter>,
}

impl MaintenanceScheduler {
    pub fn new(config: &MaintenanceConfig, limiter: Arc<RateLimiter>) -> Self {
        Self {
            interval: Duration::from_secs(config.cleanup_interval_secs.max(1)),
            retention_hours: config.retention_hours,
            limiter,
        }
    }

    /// Run one cleanup pass. Errors are logged, never propagated.
    pub async fn run_once(&self) -> usize {
        match self.limiter.cleanup(self.retention_hours).await {
            Ok(deleted) => deleted,
            Err(e) => {
                warn!(%e, "Rate limit cleanup failed");
                0
            }
        }
    }

    /// Start the background loop. The first pass runs one interval after start.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                interval_secs = self.interval.as_secs(),
                retention_hours = self.retention_hours,
                "Maintenance scheduler started"
            );
            let start = tokio::time::Instant::now() + self.interval;
            let mut ticker = tokio::time::interval_at(start, self.interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.run_once().await;
                    }
                }
            }
            debug!("Maintenance scheduler stopped");
        })
    }
}
