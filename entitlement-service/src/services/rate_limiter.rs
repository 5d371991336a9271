use super::error::EntitlementError;
use super::hit_counter::HitCounter;
use super::metrics;
use super::repository::RateLimitAuditSink;
use crate::models::{new_id, RateLimitAuditRecord, RateLimitDecision, RateLimitWindow};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

/// Fixed-window limiter. Every check counts as a hit, allowed or not.
#[derive(Clone)]
pub struct RateLimiter {
    counter: Arc<dyn HitCounter>,
    audit: Arc<dyn RateLimitAuditSink>,
    fail_open: bool,
}

impl RateLimiter {
    pub fn new(
        counter: Arc<dyn HitCounter>,
        audit: Arc<dyn RateLimitAuditSink>,
        fail_open: bool,
    ) -> Self {
        Self {
            counter,
            audit,
            fail_open,
        }
    }

    pub async fn check(
        &self,
        subject: &str,
        endpoint: &str,
        limit: u64,
        window_minutes: u32,
    ) -> Result<RateLimitDecision, EntitlementError> {
        self.check_at(subject, endpoint, limit, window_minutes, Utc::now())
            .await
    }

    pub async fn check_at(
        &self,
        subject: &str,
        endpoint: &str,
        limit: u64,
        window_minutes: u32,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision, EntitlementError> {
        let subject = subject.trim();
        let endpoint = endpoint.trim();
        if subject.is_empty() || endpoint.is_empty() {
            return Err(EntitlementError::Validation(
                "subject and endpoint are required".to_string(),
            ));
        }
        if window_minutes == 0 {
            return Err(EntitlementError::Validation(
                "window_minutes must be at least 1".to_string(),
            ));
        }

        let window = Duration::minutes(i64::from(window_minutes));
        let state = match self.counter.hit(subject, endpoint, window, now).await {
            Ok(state) => state,
            Err(e) => return self.on_store_failure(subject, endpoint, limit, e),
        };

        let allowed = state.count <= limit;
        let decision = RateLimitDecision {
            allowed,
            hits: state.count,
            limit,
            retry_after_seconds: if allowed { 0 } else { retry_after(&state, now) },
        };
        metrics::record_rate_limit_decision(endpoint, allowed);

        if !allowed {
            tracing::info!(
                subject = %subject,
                endpoint = %endpoint,
                hits = state.count,
                limit,
                "Rate limit exceeded"
            );
            let record = RateLimitAuditRecord {
                id: new_id(),
                subject: subject.to_string(),
                endpoint: endpoint.to_string(),
                hits_in_window: state.count,
                limit,
                window_minutes,
                timestamp: now,
            };
            // The decision stands even if the audit trail is unavailable.
            if let Err(e) = self.audit.append(&record).await {
                tracing::warn!(error = %e, subject = %subject, "Failed to write rate limit audit record");
            }
        }

        Ok(decision)
    }

    fn on_store_failure(
        &self,
        subject: &str,
        endpoint: &str,
        limit: u64,
        err: anyhow::Error,
    ) -> Result<RateLimitDecision, EntitlementError> {
        metrics::record_rate_limit_store_failure(self.fail_open);
        if !self.fail_open {
            return Err(EntitlementError::CounterUnavailable(err));
        }
        tracing::error!(
            error = %err,
            subject = %subject,
            endpoint = %endpoint,
            "Rate limit store unavailable, failing open"
        );
        Ok(RateLimitDecision {
            allowed: true,
            hits: 0,
            limit,
            retry_after_seconds: 0,
        })
    }
}

/// Whole seconds until the window resets, rounded up, never below one.
fn retry_after(state: &RateLimitWindow, now: DateTime<Utc>) -> u64 {
    let remaining_ms = (state.resets_at() - now).num_milliseconds().max(0) as u64;
    remaining_ms.div_ceil(1000).max(1)
}
