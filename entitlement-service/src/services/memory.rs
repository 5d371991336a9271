//! In-process repository used by tests and local runs without MongoDB.

use super::repository::{EntitlementRepository, InsertOutcome, RateLimitAuditSink};
use crate::models::{
    BonusType, Plan, RateLimitAuditRecord, Referral, ReferralStatus, SpecialAccount,
    Subscription, SubscriptionPatch, Trial, WebhookEventRecord,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct MemoryState {
    subscriptions: HashMap<String, Subscription>,
    special_accounts: HashMap<String, SpecialAccount>,
    trials: Vec<Trial>,
    referrals: Vec<Referral>,
    audit: Vec<RateLimitAuditRecord>,
    webhook_events: HashSet<String>,
}

#[derive(Default)]
pub struct InMemoryRepository {
    state: Mutex<MemoryState>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|e| anyhow!("Repository mutex poisoned: {}", e))
    }

    pub fn audit_records(&self) -> Vec<RateLimitAuditRecord> {
        self.lock().map(|s| s.audit.clone()).unwrap_or_default()
    }

    pub fn subscription_count(&self) -> usize {
        self.lock().map(|s| s.subscriptions.len()).unwrap_or_default()
    }
}

#[async_trait]
impl EntitlementRepository for InMemoryRepository {
    async fn find_subscription(&self, user_key: &str) -> Result<Option<Subscription>> {
        Ok(self.lock()?.subscriptions.get(user_key).cloned())
    }

    async fn upsert_subscription(
        &self,
        user_key: &str,
        patch: &SubscriptionPatch,
        now: DateTime<Utc>,
    ) -> Result<Subscription> {
        let mut state = self.lock()?;
        let sub = state
            .subscriptions
            .entry(user_key.to_string())
            .and_modify(|sub| patch.apply_to(sub, now))
            .or_insert_with(|| patch.new_subscription(user_key, now));
        Ok(sub.clone())
    }

    async fn extend_subscription_period(
        &self,
        user_key: &str,
        by: Duration,
        now: DateTime<Utc>,
    ) -> Result<Subscription> {
        let mut state = self.lock()?;
        let sub = state
            .subscriptions
            .entry(user_key.to_string())
            .or_insert_with(|| Subscription::default_for(user_key, now));
        sub.current_period_end = Some(sub.current_period_end.unwrap_or(now) + by);
        sub.updated_at = now;
        Ok(sub.clone())
    }

    async fn update_subscription_by_external_id(
        &self,
        external_subscription_id: &str,
        patch: &SubscriptionPatch,
        now: DateTime<Utc>,
    ) -> Result<Option<Subscription>> {
        let mut state = self.lock()?;
        let found = state
            .subscriptions
            .values_mut()
            .find(|s| s.external_subscription_id.as_deref() == Some(external_subscription_id));
        Ok(found.map(|sub| {
            patch.apply_to(sub, now);
            sub.clone()
        }))
    }

    async fn find_special_account(&self, email: &str) -> Result<Option<SpecialAccount>> {
        Ok(self.lock()?.special_accounts.get(email).cloned())
    }

    async fn insert_special_account(&self, account: &SpecialAccount) -> Result<InsertOutcome> {
        let mut state = self.lock()?;
        if state.special_accounts.contains_key(&account.email) {
            return Ok(InsertOutcome::Duplicate);
        }
        state
            .special_accounts
            .insert(account.email.clone(), account.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn find_trial(&self, email: &str, plan: Plan) -> Result<Option<Trial>> {
        Ok(self
            .lock()?
            .trials
            .iter()
            .find(|t| t.user_email == email && t.trial_plan == plan)
            .cloned())
    }

    async fn list_trials(&self, email: &str) -> Result<Vec<Trial>> {
        Ok(self
            .lock()?
            .trials
            .iter()
            .filter(|t| t.user_email == email)
            .cloned()
            .collect())
    }

    async fn insert_trial(&self, trial: &Trial) -> Result<InsertOutcome> {
        let mut state = self.lock()?;
        if state
            .trials
            .iter()
            .any(|t| t.user_email == trial.user_email && t.trial_plan == trial.trial_plan)
        {
            return Ok(InsertOutcome::Duplicate);
        }
        state.trials.push(trial.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn deactivate_trial(&self, trial_id: &str) -> Result<bool> {
        let mut state = self.lock()?;
        match state.trials.iter_mut().find(|t| t.id == trial_id && t.is_active) {
            Some(trial) => {
                trial.is_active = false;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn find_referral_by_code(&self, code: &str) -> Result<Option<Referral>> {
        Ok(self
            .lock()?
            .referrals
            .iter()
            .find(|r| r.is_anchor() && r.referral_code == code)
            .cloned())
    }

    async fn find_referral_anchor(&self, referrer_email: &str) -> Result<Option<Referral>> {
        Ok(self
            .lock()?
            .referrals
            .iter()
            .find(|r| r.is_anchor() && r.referrer_email == referrer_email)
            .cloned())
    }

    async fn find_referral(
        &self,
        referrer_email: &str,
        referred_email: &str,
    ) -> Result<Option<Referral>> {
        Ok(self
            .lock()?
            .referrals
            .iter()
            .find(|r| {
                r.referrer_email == referrer_email
                    && r.referred_email.as_deref() == Some(referred_email)
            })
            .cloned())
    }

    async fn insert_referral(&self, referral: &Referral) -> Result<InsertOutcome> {
        let mut state = self.lock()?;
        let duplicate = state.referrals.iter().any(|r| {
            r.referrer_email == referral.referrer_email && r.referred_email == referral.referred_email
        });
        if duplicate {
            return Ok(InsertOutcome::Duplicate);
        }
        state.referrals.push(referral.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn list_referrals(&self, referrer_email: &str) -> Result<Vec<Referral>> {
        Ok(self
            .lock()?
            .referrals
            .iter()
            .filter(|r| r.referrer_email == referrer_email)
            .cloned()
            .collect())
    }

    async fn reward_referral(
        &self,
        referred_email: &str,
        bonus: BonusType,
        now: DateTime<Utc>,
    ) -> Result<Option<Referral>> {
        let mut state = self.lock()?;
        let row = state
            .referrals
            .iter_mut()
            .filter(|r| {
                r.referred_email.as_deref() == Some(referred_email)
                    && r.status == ReferralStatus::SignedUp
            })
            .min_by_key(|r| r.created_at);
        Ok(row.map(|r| {
            r.status = ReferralStatus::Rewarded;
            r.bonus_type = bonus;
            r.bonus_applied = false;
            r.subscribed_at = Some(now);
            r.rewarded_at = Some(now);
            r.clone()
        }))
    }

    async fn claim_referral_bonus(
        &self,
        referrer_email: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Referral>> {
        let mut state = self.lock()?;
        let row = state
            .referrals
            .iter_mut()
            .filter(|r| {
                r.referrer_email == referrer_email
                    && r.status == ReferralStatus::Rewarded
                    && !r.bonus_applied
            })
            .min_by_key(|r| r.created_at);
        Ok(row.map(|r| {
            r.bonus_applied = true;
            r.bonus_applied_at = Some(now);
            r.clone()
        }))
    }

    async fn release_referral_bonus(&self, referral_id: &str) -> Result<()> {
        let mut state = self.lock()?;
        if let Some(r) = state.referrals.iter_mut().find(|r| r.id == referral_id) {
            r.bonus_applied = false;
            r.bonus_applied_at = None;
        }
        Ok(())
    }

    async fn is_webhook_event_processed(&self, event_id: &str) -> Result<bool> {
        Ok(self.lock()?.webhook_events.contains(event_id))
    }

    async fn record_webhook_event(&self, record: &WebhookEventRecord) -> Result<()> {
        self.lock()?.webhook_events.insert(record.event_id.clone());
        Ok(())
    }
}

#[async_trait]
impl RateLimitAuditSink for InMemoryRepository {
    async fn append(&self, record: &RateLimitAuditRecord) -> Result<()> {
        self.lock()?.audit.push(record.clone());
        Ok(())
    }
}
