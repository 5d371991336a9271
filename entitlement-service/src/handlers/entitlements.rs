//! Rate limit and plan gate checks called by feature endpoints.

use axum::{extract::State, Json};
use serde::Deserialize;
use service_core::error::AppError;
use validator::Validate;

use crate::{
    middleware::CallerContext,
    models::{Plan, RateLimitDecision},
    services::{AccessDecision, AccessRequest, DenialReason},
    AppState,
};

#[derive(Debug, Deserialize, Validate)]
pub struct RateLimitCheckRequest {
    /// Defaults to the caller's email.
    pub subject: Option<String>,
    #[serde(default)]
    #[validate(length(min = 1, message = "endpoint is required"))]
    pub endpoint: String,
    #[validate(range(min = 1, message = "limit must be at least 1"))]
    pub limit: u64,
    #[validate(range(min = 1, max = 1440, message = "window_minutes must be between 1 and 1440"))]
    pub window_minutes: u32,
}

#[derive(Debug, Deserialize, Validate)]
pub struct EntitlementCheckRequest {
    #[serde(flatten)]
    #[validate(nested)]
    pub rate_limit: RateLimitCheckRequest,
    pub required_plan: Option<String>,
}

fn subject_for(subject: Option<String>, caller: Option<&CallerContext>) -> Result<String, AppError> {
    subject
        .filter(|s| !s.trim().is_empty())
        .or_else(|| caller.map(|c| c.email.clone()))
        .ok_or_else(|| AppError::BadRequest(anyhow::anyhow!("subject is required")))
}

fn rate_limited(decision: &RateLimitDecision) -> AppError {
    AppError::TooManyRequests(
        format!(
            "Rate limit exceeded. Try again in {} seconds",
            decision.retry_after_seconds
        ),
        Some(decision.retry_after_seconds),
    )
}

/// Count a hit; 429 with `Retry-After` once the window is spent.
pub async fn check_rate_limit(
    State(state): State<AppState>,
    caller: Option<CallerContext>,
    Json(req): Json<RateLimitCheckRequest>,
) -> Result<Json<RateLimitDecision>, AppError> {
    req.validate()?;
    let subject = subject_for(req.subject, caller.as_ref())?;

    let decision = state
        .rate_limiter
        .check(&subject, &req.endpoint, req.limit, req.window_minutes)
        .await?;

    if !decision.allowed {
        return Err(rate_limited(&decision));
    }
    Ok(Json(decision))
}

/// Rate limit plus optional minimum plan. 429 when rate limited, 403 when
/// the effective plan is too low.
pub async fn check_entitlement(
    State(state): State<AppState>,
    caller: Option<CallerContext>,
    Json(req): Json<EntitlementCheckRequest>,
) -> Result<Json<AccessDecision>, AppError> {
    req.validate()?;
    let required_plan = req
        .required_plan
        .as_deref()
        .map(str::parse::<Plan>)
        .transpose()
        .map_err(|e| AppError::BadRequest(anyhow::anyhow!(e.to_string())))?;
    let subject = subject_for(req.rate_limit.subject, caller.as_ref())?;

    let decision = state
        .entitlements
        .check(&AccessRequest {
            subject,
            endpoint: req.rate_limit.endpoint,
            limit: req.rate_limit.limit,
            window_minutes: req.rate_limit.window_minutes,
            required_plan,
        })
        .await?;

    match decision.reason {
        Some(DenialReason::RateLimited) => Err(rate_limited(&decision.rate_limit)),
        Some(DenialReason::PlanRequired) => Err(AppError::Forbidden(anyhow::anyhow!(
            "This feature requires the {} plan or higher",
            decision.required_plan.unwrap_or(Plan::Free)
        ))),
        None => Ok(Json(decision)),
    }
}
