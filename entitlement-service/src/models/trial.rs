use super::Plan;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One trial per (user_email, trial_plan), ever.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    #[serde(rename = "_id")]
    pub id: String,
    pub user_email: String,
    pub trial_plan: Plan,
    pub trial_start: DateTime<Utc>,
    pub trial_end: DateTime<Utc>,
    /// Cached flag; may lag behind `trial_end` until a sweep runs.
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl Trial {
    /// Whether the trial grants its plan at `now`. Computed from `trial_end`,
    /// never from the cached flag.
    pub fn is_in_effect(&self, now: DateTime<Utc>) -> bool {
        now <= self.trial_end
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.trial_end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn trial(end: DateTime<Utc>) -> Trial {
        Trial {
            id: "t1".to_string(),
            user_email: "a@x.com".to_string(),
            trial_plan: Plan::Premium,
            trial_start: end - Duration::days(7),
            trial_end: end,
            is_active: true,
            created_at: end - Duration::days(7),
        }
    }

    #[test]
    fn trial_is_in_effect_up_to_and_including_end() {
        let end = Utc::now();
        let t = trial(end);
        assert!(t.is_in_effect(end));
        assert!(!t.is_expired(end));
        assert!(t.is_expired(end + Duration::seconds(1)));
    }

    #[test]
    fn stale_active_flag_does_not_grant_access() {
        let end = Utc::now() - Duration::days(1);
        let t = trial(end);
        assert!(t.is_active);
        assert!(!t.is_in_effect(Utc::now()));
    }
}
