//! Axum-based admin HTTP server for operators.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use collab_relay_core::error::RelayError;

use crate::state::RelayState;

/// Store failure surfaced to an admin client.
struct AdminError(RelayError);

impl From<RelayError> for AdminError {
    fn from(e: RelayError) -> Self {
        Self(e)
    }
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        warn!(e = %self.0, "Admin request failed");
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": self.0.to_string() })),
        )
            .into_response()
    }
}

/// Build the admin router.
pub fn admin_router(state: Arc<RelayState>) -> Router {
    let router = Router::new()
        .route("/health", get(health_handler))
        .route("/cluster", get(cluster_handler))
        .route("/rate-limit/stats", get(stats_handler))
        .route("/rate-limit/users/{user_id}", get(user_status_handler));

    #[cfg(feature = "prometheus")]
    let router = router.route("/metrics", get(metrics_handler));

    router.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Serve the admin API until `cancel` fires.
pub async fn start_admin_server(
    state: Arc<RelayState>,
    bind: &str,
    port: u16,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let addr = format!("{bind}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Admin server listening on {addr}");

    axum::serve(listener, admin_router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    info!("Admin server stopped");
    Ok(())
}

async fn health_handler(State(state): State<Arc<RelayState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "instanceId": state.coordinator.instance_id(),
        "state": state.coordinator.state(),
    }))
}

async fn cluster_handler(
    State(state): State<Arc<RelayState>>,
) -> Result<Json<Value>, AdminError> {
    let stats = state.coordinator.get_cluster_stats().await?;
    Ok(Json(serde_json::to_value(stats).map_err(RelayError::from)?))
}

#[derive(Debug, Deserialize)]
struct StatsQuery {
    minutes: Option<u32>,
}

async fn stats_handler(
    State(state): State<Arc<RelayState>>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<Value>, AdminError> {
    let stats = state
        .rate_limiter
        .get_stats(query.minutes.unwrap_or(60))
        .await?;
    Ok(Json(serde_json::to_value(stats).map_err(RelayError::from)?))
}

async fn user_status_handler(
    State(state): State<Arc<RelayState>>,
    Path(user_id): Path<String>,
) -> Result<Json<Value>, AdminError> {
    let status = state.rate_limiter.get_rate_limit_status(&user_id).await?;
    Ok(Json(serde_json::to_value(status).map_err(RelayError::from)?))
}

#[cfg(feature = "prometheus")]
async fn metrics_handler(State(state): State<Arc<RelayState>>) -> Response {
    match &state.metrics_handle {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics exporter not installed").into_response(),
    }
}
