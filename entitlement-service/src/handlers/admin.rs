//! Admin-only entitlement management.

use axum::{extract::State, http::StatusCode, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use validator::Validate;

use crate::{
    middleware::CallerContext,
    models::{AccountType, Plan, SpecialAccount},
    services::NewSpecialAccount,
    AppState,
};

#[derive(Debug, Deserialize, Validate)]
pub struct OverrideRequest {
    #[serde(default)]
    #[validate(email(message = "target_email must be a valid email"))]
    pub target_email: String,
    #[serde(default)]
    #[validate(length(min = 1, message = "new_tier is required"))]
    pub new_tier: String,
    #[serde(default)]
    #[validate(length(min = 1, max = 500, message = "reason is required"))]
    pub reason: String,
}

#[derive(Debug, Serialize)]
pub struct OverrideResponse {
    pub success: bool,
    pub subscription_id: String,
    pub user_key: String,
    pub plan: Plan,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateSpecialAccountRequest {
    #[serde(default)]
    #[validate(email(message = "email must be a valid email"))]
    pub email: String,
    #[serde(default)]
    #[validate(length(min = 1, message = "account_type is required"))]
    pub account_type: String,
    #[serde(default)]
    #[validate(length(min = 1, message = "tier is required"))]
    pub tier: String,
    #[validate(length(max = 1000, message = "notes must be at most 1000 characters"))]
    pub notes: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct CreateSpecialAccountResponse {
    pub account: SpecialAccount,
    pub subscription_id: String,
}

fn parse_plan(raw: &str) -> Result<Plan, AppError> {
    raw.parse()
        .map_err(|e: crate::models::PlanParseError| AppError::BadRequest(anyhow::anyhow!(e.to_string())))
}

pub async fn override_entitlement(
    State(state): State<AppState>,
    caller: CallerContext,
    Json(req): Json<OverrideRequest>,
) -> Result<Json<OverrideResponse>, AppError> {
    caller.require_admin()?;
    req.validate()?;
    let new_tier = parse_plan(&req.new_tier)?;

    let sub = state
        .ledger
        .admin_override(&req.target_email, new_tier, &req.reason, &caller.email)
        .await?;

    Ok(Json(OverrideResponse {
        success: true,
        subscription_id: sub.id,
        user_key: sub.user_key,
        plan: sub.plan,
    }))
}

pub async fn create_special_account(
    State(state): State<AppState>,
    caller: CallerContext,
    Json(req): Json<CreateSpecialAccountRequest>,
) -> Result<(StatusCode, Json<CreateSpecialAccountResponse>), AppError> {
    caller.require_admin()?;
    req.validate()?;
    let tier = parse_plan(&req.tier)?;
    let account_type: AccountType = req
        .account_type
        .parse()
        .map_err(|e: String| AppError::BadRequest(anyhow::anyhow!(e)))?;

    let (account, subscription) = state
        .special_accounts
        .create(
            NewSpecialAccount {
                email: req.email,
                account_type,
                tier,
                notes: req.notes,
                expires_at: req.expires_at,
            },
            &caller.email,
        )
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateSpecialAccountResponse {
            account,
            subscription_id: subscription.id,
        }),
    ))
}
