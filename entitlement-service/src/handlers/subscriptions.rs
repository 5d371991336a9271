use axum::{extract::State, Json};
use chrono::Utc;
use serde::Serialize;
use service_core::error::AppError;

use crate::{
    middleware::CallerContext,
    models::{Plan, Subscription, Trial},
    AppState,
};

#[derive(Debug, Serialize)]
pub struct MySubscriptionResponse {
    pub user_key: String,
    /// Plan of record in the ledger.
    pub plan: Plan,
    /// Plan after trials in effect are taken into account.
    pub effective_plan: Plan,
    pub subscription: Option<Subscription>,
    pub active_trials: Vec<Trial>,
}

pub async fn get_my_subscription(
    State(state): State<AppState>,
    caller: CallerContext,
) -> Result<Json<MySubscriptionResponse>, AppError> {
    let now = Utc::now();
    let subscription = state.ledger.get(&caller.email).await?;
    let active_trials = state.trials.active_trials_at(&caller.email, now).await?;
    let plan = subscription.as_ref().map(|s| s.plan).unwrap_or(Plan::Free);
    let effective_plan = state.entitlements.effective_plan_at(&caller.email, now).await?;

    Ok(Json(MySubscriptionResponse {
        user_key: caller.email,
        plan,
        effective_plan,
        subscription,
        active_trials,
    }))
}
