//! Metrics recording. Calls are no-ops until a recorder is installed.

use collab_relay_core::protocol::EnvelopeKind;

/// Install the Prometheus metrics recorder and return the handle for rendering.
#[cfg(feature = "prometheus")]
pub fn install_prometheus_recorder(
) -> anyhow::Result<metrics_exporter_prometheus::PrometheusHandle> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus recorder: {e}"))
}

pub fn record_envelope_published(kind: EnvelopeKind) {
    let labels = [("type", kind.as_str())];
    metrics::counter!("cluster_envelopes_published_total", &labels).increment(1);
}

pub fn record_envelope_received(kind: EnvelopeKind) {
    let labels = [("type", kind.as_str())];
    metrics::counter!("cluster_envelopes_received_total", &labels).increment(1);
}

/// Record an envelope dropped on receipt (`self_origin`, `malformed`, `unknown_type`).
pub fn record_envelope_dropped(reason: &'static str) {
    let labels = [("reason", reason)];
    metrics::counter!("cluster_envelopes_dropped_total", &labels).increment(1);
}

pub fn record_active_instances(count: usize) {
    metrics::gauge!("cluster_active_instances").set(count as f64);
}

pub fn record_heartbeat_failure() {
    metrics::counter!("cluster_heartbeat_failures_total").increment(1);
}

/// Record a rate-limit decision (`allowed`, `denied`, `penalized`, `fail_open`).
pub fn record_rate_limit_decision(outcome: &'static str) {
    let labels = [("outcome", outcome)];
    metrics::counter!("rate_limit_decisions_total", &labels).increment(1);
}
