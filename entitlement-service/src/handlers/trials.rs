use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;

use crate::{
    middleware::CallerContext,
    models::{Plan, Trial},
    AppState,
};

#[derive(Debug, Deserialize)]
pub struct EligibilityQuery {
    pub plan: String,
}

#[derive(Debug, Serialize)]
pub struct EligibilityResponse {
    pub plan: Plan,
    pub eligible: bool,
}

#[derive(Debug, Deserialize)]
pub struct StartTrialRequest {
    pub plan: String,
    pub days: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct SweepResponse {
    pub deactivated: u32,
}

fn parse_plan(raw: &str) -> Result<Plan, AppError> {
    raw.parse()
        .map_err(|e: crate::models::PlanParseError| AppError::BadRequest(anyhow::anyhow!(e.to_string())))
}

pub async fn trial_eligibility(
    State(state): State<AppState>,
    caller: CallerContext,
    Query(query): Query<EligibilityQuery>,
) -> Result<Json<EligibilityResponse>, AppError> {
    let plan = parse_plan(&query.plan)?;
    let eligible = plan.is_paid() && state.trials.can_start_trial(&caller.email, plan).await?;
    Ok(Json(EligibilityResponse { plan, eligible }))
}

pub async fn start_trial(
    State(state): State<AppState>,
    caller: CallerContext,
    Json(req): Json<StartTrialRequest>,
) -> Result<(StatusCode, Json<Trial>), AppError> {
    let plan = parse_plan(&req.plan)?;
    let trial = state
        .trials
        .start_trial(&caller.email, plan, req.days)
        .await?;
    Ok((StatusCode::CREATED, Json(trial)))
}

/// Lazy expiry, typically called by the front-end on login.
pub async fn sweep_trials(
    State(state): State<AppState>,
    caller: CallerContext,
) -> Result<Json<SweepResponse>, AppError> {
    let deactivated = state.trials.sweep_expired(&caller.email).await?;
    Ok(Json(SweepResponse { deactivated }))
}
