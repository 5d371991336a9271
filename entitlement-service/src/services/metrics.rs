use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder. Later calls are no-ops.
pub fn init_metrics() {
    METRICS_HANDLE.get_or_init(|| match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => handle,
        Err(e) => {
            tracing::error!("Failed to install Prometheus recorder: {}", e);
            panic!("Failed to initialize metrics: {}", e);
        }
    });
}

pub fn get_metrics() -> String {
    match METRICS_HANDLE.get() {
        Some(handle) => handle.render(),
        None => "# Metrics recorder not initialized\n".to_string(),
    }
}

pub fn record_rate_limit_decision(endpoint: &str, allowed: bool) {
    let outcome = if allowed { "allowed" } else { "denied" };
    metrics::counter!(
        "rate_limit_checks_total",
        "endpoint" => endpoint.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_rate_limit_store_failure(fail_open: bool) {
    let mode = if fail_open { "open" } else { "closed" };
    metrics::counter!("rate_limit_store_failures_total", "mode" => mode).increment(1);
}

pub fn record_webhook_event(event_type: &str, outcome: &str) {
    metrics::counter!(
        "payment_webhook_events_total",
        "event_type" => event_type.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

pub fn record_entitlement_decision(allowed: bool, reason: &str) {
    metrics::counter!(
        "entitlement_checks_total",
        "allowed" => allowed.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

pub fn record_trial_started(plan: &str) {
    metrics::counter!("trials_started_total", "plan" => plan.to_string()).increment(1);
}

pub fn record_referral_event(stage: &str) {
    metrics::counter!("referral_events_total", "stage" => stage.to_string()).increment(1);
}

pub fn set_tracked_windows(count: usize) {
    metrics::gauge!("rate_limit_tracked_windows").set(count as f64);
}
