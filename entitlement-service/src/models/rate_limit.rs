use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Counter state for one (subject, endpoint) key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitWindow {
    pub count: u64,
    pub window_start: DateTime<Utc>,
    pub window: Duration,
}

impl RateLimitWindow {
    pub fn open(now: DateTime<Utc>, window: Duration) -> Self {
        Self {
            count: 0,
            window_start: now,
            window,
        }
    }

    /// A window covers `[window_start, window_start + window)`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now - self.window_start >= self.window
    }

    pub fn resets_at(&self) -> DateTime<Utc> {
        self.window_start + self.window
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub hits: u64,
    pub limit: u64,
    /// Whole seconds until the window resets. Zero when allowed.
    pub retry_after_seconds: u64,
}

/// Appended each time a request is denied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitAuditRecord {
    #[serde(rename = "_id")]
    pub id: String,
    pub subject: String,
    pub endpoint: String,
    pub hits_in_window: u64,
    pub limit: u64,
    pub window_minutes: u32,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_expires_exactly_at_boundary() {
        let start = Utc::now();
        let w = RateLimitWindow::open(start, Duration::minutes(1));
        assert!(!w.is_expired(start + Duration::seconds(59)));
        assert!(w.is_expired(start + Duration::seconds(60)));
    }

    #[test]
    fn decision_uses_camel_case_on_the_wire() {
        let d = RateLimitDecision {
            allowed: false,
            hits: 4,
            limit: 3,
            retry_after_seconds: 12,
        };
        let json = serde_json::to_value(&d).unwrap();
        assert_eq!(json["retryAfterSeconds"], 12);
    }
}
