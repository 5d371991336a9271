use super::error::EntitlementError;
use super::ledger::SubscriptionLedger;
use super::metrics;
use super::rate_limiter::RateLimiter;
use super::trials::TrialLifecycleManager;
use crate::models::{Plan, RateLimitDecision};
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone)]
pub struct AccessRequest {
    pub subject: String,
    pub endpoint: String,
    pub limit: u64,
    pub window_minutes: u32,
    pub required_plan: Option<Plan>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    RateLimited,
    PlanRequired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessDecision {
    pub allowed: bool,
    pub rate_limit: RateLimitDecision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effective_plan: Option<Plan>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required_plan: Option<Plan>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<DenialReason>,
}

/// Single entry point for gated features: rate limit first, then plan.
#[derive(Clone)]
pub struct EntitlementFacade {
    rate_limiter: RateLimiter,
    ledger: SubscriptionLedger,
    trials: TrialLifecycleManager,
}

impl EntitlementFacade {
    pub fn new(
        rate_limiter: RateLimiter,
        ledger: SubscriptionLedger,
        trials: TrialLifecycleManager,
    ) -> Self {
        Self {
            rate_limiter,
            ledger,
            trials,
        }
    }

    pub async fn check(&self, request: &AccessRequest) -> Result<AccessDecision, EntitlementError> {
        self.check_at(request, Utc::now()).await
    }

    pub async fn check_at(
        &self,
        request: &AccessRequest,
        now: DateTime<Utc>,
    ) -> Result<AccessDecision, EntitlementError> {
        let rate_limit = self
            .rate_limiter
            .check_at(
                &request.subject,
                &request.endpoint,
                request.limit,
                request.window_minutes,
                now,
            )
            .await?;

        if !rate_limit.allowed {
            metrics::record_entitlement_decision(false, "rate_limited");
            return Ok(AccessDecision {
                allowed: false,
                rate_limit,
                effective_plan: None,
                required_plan: request.required_plan,
                reason: Some(DenialReason::RateLimited),
            });
        }

        let Some(required) = request.required_plan else {
            metrics::record_entitlement_decision(true, "rate_only");
            return Ok(AccessDecision {
                allowed: true,
                rate_limit,
                effective_plan: None,
                required_plan: None,
                reason: None,
            });
        };

        let plan = self.effective_plan_at(&request.subject, now).await?;
        let allowed = plan.satisfies(required);
        metrics::record_entitlement_decision(allowed, if allowed { "plan_ok" } else { "plan_required" });

        Ok(AccessDecision {
            allowed,
            rate_limit,
            effective_plan: Some(plan),
            required_plan: Some(required),
            reason: (!allowed).then_some(DenialReason::PlanRequired),
        })
    }

    pub async fn effective_plan(&self, user_key: &str) -> Result<Plan, EntitlementError> {
        self.effective_plan_at(user_key, Utc::now()).await
    }

    /// Highest of the plan of record and any trial in effect at `now`.
    pub async fn effective_plan_at(
        &self,
        user_key: &str,
        now: DateTime<Utc>,
    ) -> Result<Plan, EntitlementError> {
        let base = self.ledger.get_plan(user_key).await?;
        let trials = self.trials.active_trials_at(user_key, now).await?;
        Ok(trials.iter().fold(base, |plan, t| plan.max(t.trial_plan)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SubscriptionPatch;
    use crate::services::hit_counter::InMemoryHitCounter;
    use crate::services::memory::InMemoryRepository;
    use crate::services::repository::EntitlementRepository;
    use chrono::Duration;
    use std::sync::Arc;

    fn facade() -> (EntitlementFacade, SubscriptionLedger, TrialLifecycleManager) {
        let repo = Arc::new(InMemoryRepository::new());
        let dyn_repo: Arc<dyn EntitlementRepository> = repo.clone();
        let limiter = RateLimiter::new(Arc::new(InMemoryHitCounter::new()), repo, false);
        let ledger = SubscriptionLedger::new(dyn_repo.clone());
        let trials = TrialLifecycleManager::new(dyn_repo, 7, 30);
        (
            EntitlementFacade::new(limiter, ledger.clone(), trials.clone()),
            ledger,
            trials,
        )
    }

    fn request(required: Option<Plan>) -> AccessRequest {
        AccessRequest {
            subject: "a@x.com".to_string(),
            endpoint: "export".to_string(),
            limit: 2,
            window_minutes: 1,
            required_plan: required,
        }
    }

    #[tokio::test]
    async fn plan_gate_uses_subscription() {
        let (facade, ledger, _) = facade();
        let denied = facade.check(&request(Some(Plan::Premium))).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.reason, Some(DenialReason::PlanRequired));
        assert_eq!(denied.effective_plan, Some(Plan::Free));

        ledger
            .upsert("a@x.com", &SubscriptionPatch::plan(Plan::Family))
            .await
            .unwrap();
        let allowed = facade.check(&request(Some(Plan::Premium))).await.unwrap();
        assert!(allowed.allowed);
    }

    #[tokio::test]
    async fn trial_lifts_plan_until_it_ends() {
        let (facade, _, trials) = facade();
        let now = Utc::now();
        trials
            .start_trial_at("a@x.com", Plan::Premium, Some(7), now)
            .await
            .unwrap();

        assert_eq!(facade.effective_plan_at("a@x.com", now).await.unwrap(), Plan::Premium);
        assert_eq!(
            facade
                .effective_plan_at("a@x.com", now + Duration::days(8))
                .await
                .unwrap(),
            Plan::Free
        );
    }

    #[tokio::test]
    async fn rate_limit_is_checked_before_plan() {
        let (facade, _, _) = facade();
        let now = Utc::now();
        for _ in 0..2 {
            facade.check_at(&request(None), now).await.unwrap();
        }
        let denied = facade.check_at(&request(Some(Plan::Free)), now).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.reason, Some(DenialReason::RateLimited));
        assert_eq!(denied.rate_limit.hits, 3);
        assert!(denied.rate_limit.retry_after_seconds >= 1);
    }
}
