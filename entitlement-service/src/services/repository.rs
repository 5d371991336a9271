use crate::models::{
    BonusType, Plan, RateLimitAuditRecord, Referral, SpecialAccount, Subscription,
    SubscriptionPatch, Trial, WebhookEventRecord,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

/// Result of an insert guarded by a unique key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

/// Persistence for every entitlement record.
///
/// Implementations must make the conditional updates atomic: a
/// concurrent caller observes either the old row or the new one.
#[async_trait]
pub trait EntitlementRepository: Send + Sync {
    async fn find_subscription(&self, user_key: &str) -> Result<Option<Subscription>>;

    /// Create-or-update keyed by `user_key`. At most one row per key.
    async fn upsert_subscription(
        &self,
        user_key: &str,
        patch: &SubscriptionPatch,
        now: DateTime<Utc>,
    ) -> Result<Subscription>;

    /// Push `current_period_end` out by `by` from its stored value, or from
    /// `now` when unset, creating the row if needed. Concurrent extensions
    /// all land.
    async fn extend_subscription_period(
        &self,
        user_key: &str,
        by: Duration,
        now: DateTime<Utc>,
    ) -> Result<Subscription>;

    async fn update_subscription_by_external_id(
        &self,
        external_subscription_id: &str,
        patch: &SubscriptionPatch,
        now: DateTime<Utc>,
    ) -> Result<Option<Subscription>>;

    async fn find_special_account(&self, email: &str) -> Result<Option<SpecialAccount>>;
    async fn insert_special_account(&self, account: &SpecialAccount) -> Result<InsertOutcome>;

    async fn find_trial(&self, email: &str, plan: Plan) -> Result<Option<Trial>>;
    async fn list_trials(&self, email: &str) -> Result<Vec<Trial>>;
    async fn insert_trial(&self, trial: &Trial) -> Result<InsertOutcome>;
    /// Clears `is_active`; returns whether this call changed the row.
    async fn deactivate_trial(&self, trial_id: &str) -> Result<bool>;

    /// The code anchor owning `code`.
    async fn find_referral_by_code(&self, code: &str) -> Result<Option<Referral>>;
    async fn find_referral_anchor(&self, referrer_email: &str) -> Result<Option<Referral>>;
    async fn find_referral(
        &self,
        referrer_email: &str,
        referred_email: &str,
    ) -> Result<Option<Referral>>;
    async fn insert_referral(&self, referral: &Referral) -> Result<InsertOutcome>;
    async fn list_referrals(&self, referrer_email: &str) -> Result<Vec<Referral>>;

    /// Move the oldest `signed_up` row for `referred_email` to `rewarded`.
    async fn reward_referral(
        &self,
        referred_email: &str,
        bonus: BonusType,
        now: DateTime<Utc>,
    ) -> Result<Option<Referral>>;

    /// Mark the oldest rewarded, unapplied bonus of `referrer_email` as applied.
    async fn claim_referral_bonus(
        &self,
        referrer_email: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Referral>>;

    /// Undo a claim whose side effect failed.
    async fn release_referral_bonus(&self, referral_id: &str) -> Result<()>;

    async fn is_webhook_event_processed(&self, event_id: &str) -> Result<bool>;
    async fn record_webhook_event(&self, record: &WebhookEventRecord) -> Result<()>;
}

/// Append-only sink for denied rate limit checks.
#[async_trait]
pub trait RateLimitAuditSink: Send + Sync {
    async fn append(&self, record: &RateLimitAuditRecord) -> Result<()>;
}
