use super::error::EntitlementError;
use super::repository::EntitlementRepository;
use crate::models::{
    normalize_email, Plan, Subscription, SubscriptionPatch, SubscriptionStatus,
    ADMIN_ADJUSTED_CUSTOMER_ID,
};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

/// Current plan and billing state per user key.
#[derive(Clone)]
pub struct SubscriptionLedger {
    repo: Arc<dyn EntitlementRepository>,
}

impl SubscriptionLedger {
    pub fn new(repo: Arc<dyn EntitlementRepository>) -> Self {
        Self { repo }
    }

    pub async fn get(&self, user_key: &str) -> Result<Option<Subscription>, EntitlementError> {
        Ok(self.repo.find_subscription(&normalize_email(user_key)).await?)
    }

    /// Plan of record; users without a row are on the free plan.
    pub async fn get_plan(&self, user_key: &str) -> Result<Plan, EntitlementError> {
        Ok(self
            .get(user_key)
            .await?
            .map(|s| s.plan)
            .unwrap_or(Plan::Free))
    }

    pub async fn has_entitlement(
        &self,
        user_key: &str,
        required: Plan,
    ) -> Result<bool, EntitlementError> {
        Ok(self.get_plan(user_key).await?.satisfies(required))
    }

    pub async fn upsert(
        &self,
        user_key: &str,
        patch: &SubscriptionPatch,
    ) -> Result<Subscription, EntitlementError> {
        self.upsert_at(user_key, patch, Utc::now()).await
    }

    pub async fn upsert_at(
        &self,
        user_key: &str,
        patch: &SubscriptionPatch,
        now: DateTime<Utc>,
    ) -> Result<Subscription, EntitlementError> {
        let user_key = normalize_email(user_key);
        if user_key.is_empty() {
            return Err(EntitlementError::Validation("user key is required".to_string()));
        }
        let sub = self.repo.upsert_subscription(&user_key, patch, now).await?;
        tracing::debug!(user_key = %user_key, plan = %sub.plan, status = %sub.status, "Subscription upserted");
        Ok(sub)
    }

    pub async fn update_by_external_subscription_id(
        &self,
        external_subscription_id: &str,
        patch: &SubscriptionPatch,
        now: DateTime<Utc>,
    ) -> Result<Option<Subscription>, EntitlementError> {
        Ok(self
            .repo
            .update_subscription_by_external_id(external_subscription_id, patch, now)
            .await?)
    }

    /// Push the period end out by `by` from its current value, or from now
    /// when unset.
    pub async fn extend_period(
        &self,
        user_key: &str,
        by: Duration,
        now: DateTime<Utc>,
    ) -> Result<Subscription, EntitlementError> {
        let user_key = normalize_email(user_key);
        if user_key.is_empty() {
            return Err(EntitlementError::Validation("user key is required".to_string()));
        }
        let sub = self.repo.extend_subscription_period(&user_key, by, now).await?;
        tracing::debug!(user_key = %user_key, period_end = ?sub.current_period_end, "Subscription period extended");
        Ok(sub)
    }

    /// Manual tier change by an admin. Cancellation flags are cleared and the
    /// external customer id is replaced by a sentinel.
    pub async fn admin_override(
        &self,
        target_email: &str,
        new_tier: Plan,
        reason: &str,
        admin_email: &str,
    ) -> Result<Subscription, EntitlementError> {
        let patch = SubscriptionPatch {
            plan: Some(new_tier),
            status: Some(SubscriptionStatus::Active),
            external_customer_id: Some(ADMIN_ADJUSTED_CUSTOMER_ID.to_string()),
            cancel_at_period_end: Some(false),
            ..Default::default()
        };
        let sub = self.upsert(target_email, &patch).await?;
        tracing::info!(
            target = %sub.user_key,
            new_tier = %new_tier,
            admin = %admin_email,
            reason = %reason,
            "Admin tier override applied"
        );
        Ok(sub)
    }
}
