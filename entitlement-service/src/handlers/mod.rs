//! HTTP handlers for entitlement-service.

pub mod admin;
pub mod entitlements;
pub mod referrals;
pub mod subscriptions;
pub mod trials;
pub mod webhooks;

use crate::{services::get_metrics, AppState};
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

pub async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "service": "entitlement-service",
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}

/// Ready once the rate limit counter store answers.
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.counter.health_check().await {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "ready" }))),
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unavailable" })),
            )
        }
    }
}

pub async fn metrics_endpoint() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        get_metrics(),
    )
}
