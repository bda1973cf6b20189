//! Node shared state.

use std::sync::Arc;

use collab_relay_core::config::Config;

use crate::coordinator::ClusterCoordinator;
use crate::rate_limit::RateLimiter;

/// Shared node state accessible from the admin server and background tasks.
pub struct RelayState {
    pub config: Arc<Config>,
    pub coordinator: Arc<ClusterCoordinator>,
    pub rate_limiter: Arc<RateLimiter>,
    #[cfg(feature = "prometheus")]
    pub metrics_handle: Option<metrics_exporter_prometheus::PrometheusHandle>,
}

impl RelayState {
    pub fn new(
        config: Arc<Config>,
        coordinator: Arc<ClusterCoordinator>,
        rate_limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            config,
            coordinator,
            rate_limiter,
            #[cfg(feature = "prometheus")]
            metrics_handle: None,
        }
    }

    #[cfg(feature = "prometheus")]
    pub fn with_metrics(mut self, handle: metrics_exporter_prometheus::PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }
}
