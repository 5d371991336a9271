use super::error::EntitlementError;
use super::metrics;
use super::repository::{EntitlementRepository, InsertOutcome};
use crate::models::{new_id, normalize_email, Plan, Trial};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

/// One trial per (user, plan), ever. Expiry is pull-based: `sweep_expired`
/// clears the cached flag, but entitlement reads compare against `trial_end`.
#[derive(Clone)]
pub struct TrialLifecycleManager {
    repo: Arc<dyn EntitlementRepository>,
    default_days: u32,
    max_days: u32,
}

impl TrialLifecycleManager {
    pub fn new(repo: Arc<dyn EntitlementRepository>, default_days: u32, max_days: u32) -> Self {
        Self {
            repo,
            default_days,
            max_days,
        }
    }

    pub async fn can_start_trial(&self, email: &str, plan: Plan) -> Result<bool, EntitlementError> {
        let email = normalize_email(email);
        Ok(self.repo.find_trial(&email, plan).await?.is_none())
    }

    pub async fn start_trial(
        &self,
        email: &str,
        plan: Plan,
        days: Option<u32>,
    ) -> Result<Trial, EntitlementError> {
        self.start_trial_at(email, plan, days, Utc::now()).await
    }

    pub async fn start_trial_at(
        &self,
        email: &str,
        plan: Plan,
        days: Option<u32>,
        now: DateTime<Utc>,
    ) -> Result<Trial, EntitlementError> {
        let email = normalize_email(email);
        if email.is_empty() {
            return Err(EntitlementError::Validation("email is required".to_string()));
        }
        if !plan.is_paid() {
            return Err(EntitlementError::Validation(
                "Trials are only available for paid plans".to_string(),
            ));
        }
        let days = days.unwrap_or(self.default_days);
        if days == 0 || days > self.max_days {
            return Err(EntitlementError::Validation(format!(
                "Trial length must be between 1 and {} days",
                self.max_days
            )));
        }

        let trial = Trial {
            id: new_id(),
            user_email: email.clone(),
            trial_plan: plan,
            trial_start: now,
            trial_end: now + Duration::days(i64::from(days)),
            is_active: true,
            created_at: now,
        };

        // The unique (user_email, trial_plan) key settles concurrent starts.
        match self.repo.insert_trial(&trial).await? {
            InsertOutcome::Inserted => {
                tracing::info!(email = %email, plan = %plan, days, "Trial started");
                metrics::record_trial_started(plan.as_str());
                Ok(trial)
            }
            InsertOutcome::Duplicate => Err(EntitlementError::Conflict(format!(
                "Trial already used for plan {}",
                plan
            ))),
        }
    }

    /// Trials granting their plan at `now`, whatever the cached flag says.
    pub async fn active_trials_at(
        &self,
        email: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Trial>, EntitlementError> {
        let email = normalize_email(email);
        Ok(self
            .repo
            .list_trials(&email)
            .await?
            .into_iter()
            .filter(|t| t.is_in_effect(now))
            .collect())
    }

    pub async fn sweep_expired(&self, email: &str) -> Result<u32, EntitlementError> {
        self.sweep_expired_at(email, Utc::now()).await
    }

    /// Clear `is_active` on every expired trial of the user. Returns how many flipped.
    pub async fn sweep_expired_at(
        &self,
        email: &str,
        now: DateTime<Utc>,
    ) -> Result<u32, EntitlementError> {
        let email = normalize_email(email);
        let mut flipped = 0;
        for trial in self.repo.list_trials(&email).await? {
            if trial.is_active && trial.is_expired(now) && self.repo.deactivate_trial(&trial.id).await? {
                flipped += 1;
            }
        }
        if flipped > 0 {
            tracing::info!(email = %email, flipped, "Expired trials deactivated");
        }
        Ok(flipped)
    }
}
