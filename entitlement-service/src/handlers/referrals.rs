//! Referral program endpoints.

use axum::{extract::State, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;

use crate::{
    middleware::CallerContext,
    models::{normalize_email, BonusType, Referral, ReferralStats},
    AppState,
};

/// Body of the multiplexed referral endpoint.
#[derive(Debug, Deserialize)]
pub struct ReferralActionRequest {
    pub action: String,
    pub referral_code: Option<String>,
    pub referred_email: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum ReferralActionResponse {
    Referral { success: bool, referral: Referral },
    Stats(ReferralStats),
}

#[derive(Debug, Serialize)]
pub struct ReferralCodeResponse {
    pub referral_code: String,
}

#[derive(Debug, Serialize)]
pub struct ApplyBonusResponse {
    pub applied: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bonus_type: Option<BonusType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_period_end: Option<DateTime<Utc>>,
}

/// The referred user defaults to the caller; acting for someone else needs admin.
fn referred_for(caller: &CallerContext, requested: Option<String>) -> Result<String, AppError> {
    match requested.map(|e| normalize_email(&e)).filter(|e| !e.is_empty()) {
        Some(email) if email != caller.email => {
            caller.require_admin()?;
            Ok(email)
        }
        _ => Ok(caller.email.clone()),
    }
}

pub async fn referral_action(
    State(state): State<AppState>,
    caller: CallerContext,
    Json(req): Json<ReferralActionRequest>,
) -> Result<Json<ReferralActionResponse>, AppError> {
    match req.action.as_str() {
        "trackReferralSignup" => {
            let code = req
                .referral_code
                .filter(|c| !c.trim().is_empty())
                .ok_or_else(|| AppError::BadRequest(anyhow::anyhow!("referral_code is required")))?;
            let referred = referred_for(&caller, req.referred_email)?;
            let referral = state.referrals.track_signup(&code, &referred).await?;
            Ok(Json(ReferralActionResponse::Referral {
                success: true,
                referral,
            }))
        }
        "rewardReferrer" => {
            let referred = referred_for(&caller, req.referred_email)?;
            let referral = state.referrals.reward_referrer(&referred).await?;
            Ok(Json(ReferralActionResponse::Referral {
                success: true,
                referral,
            }))
        }
        "getStats" => {
            let stats = state.referrals.stats(&caller.email).await?;
            Ok(Json(ReferralActionResponse::Stats(stats)))
        }
        other => Err(AppError::BadRequest(anyhow::anyhow!(
            "Unknown action: {}",
            other
        ))),
    }
}

pub async fn get_referral_code(
    State(state): State<AppState>,
    caller: CallerContext,
) -> Result<Json<ReferralCodeResponse>, AppError> {
    let referral_code = state.referrals.referral_code(&caller.email).await?;
    Ok(Json(ReferralCodeResponse { referral_code }))
}

/// Claims one pending bonus per call.
pub async fn apply_bonus(
    State(state): State<AppState>,
    caller: CallerContext,
) -> Result<Json<ApplyBonusResponse>, AppError> {
    let applied = state.referrals.apply_referral_bonus(&caller.email).await?;
    Ok(Json(match applied {
        Some(bonus) => ApplyBonusResponse {
            applied: true,
            bonus_type: Some(bonus.referral.bonus_type),
            current_period_end: bonus.subscription.and_then(|s| s.current_period_end),
        },
        None => ApplyBonusResponse {
            applied: false,
            bonus_type: None,
            current_period_end: None,
        },
    }))
}
