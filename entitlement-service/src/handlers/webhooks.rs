use axum::{body::Bytes, extract::State, http::HeaderMap, Json};
use serde::Serialize;
use service_core::error::AppError;

use crate::{services::SIGNATURE_HEADER, AppState};

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub received: bool,
}

/// Payment processor webhook.
///
/// Every verified delivery is acknowledged, including ones whose processing
/// failed, so the processor does not redeliver non-retryable events. Only
/// signature and envelope failures are rejected.
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, AppError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());

    let outcome = state.webhooks.handle(&body, signature).await.map_err(|e| {
        tracing::warn!(error = %e, "Webhook rejected");
        AppError::from(e)
    })?;

    tracing::debug!(outcome = outcome.as_str(), "Webhook handled");
    Ok(Json(WebhookAck { received: true }))
}
