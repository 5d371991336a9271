use super::{new_id, Plan};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Customer id written by admin tier overrides.
pub const ADMIN_ADJUSTED_CUSTOMER_ID: &str = "admin_adjusted";
/// Customer id written for special (gift/development) accounts.
pub const EXEMPT_SPECIAL_CUSTOMER_ID: &str = "exempt_special";

/// Provider subscription state. Unknown provider states are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Canceled,
    Incomplete,
    IncompleteExpired,
    Unpaid,
    Paused,
    Other(String),
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Incomplete => "incomplete",
            SubscriptionStatus::IncompleteExpired => "incomplete_expired",
            SubscriptionStatus::Unpaid => "unpaid",
            SubscriptionStatus::Paused => "paused",
            SubscriptionStatus::Other(s) => s,
        }
    }
}

impl From<String> for SubscriptionStatus {
    fn from(value: String) -> Self {
        match value.as_str() {
            "active" => SubscriptionStatus::Active,
            "trialing" => SubscriptionStatus::Trialing,
            "past_due" => SubscriptionStatus::PastDue,
            // Stripe has used both spellings.
            "canceled" | "cancelled" => SubscriptionStatus::Canceled,
            "incomplete" => SubscriptionStatus::Incomplete,
            "incomplete_expired" => SubscriptionStatus::IncompleteExpired,
            "unpaid" => SubscriptionStatus::Unpaid,
            "paused" => SubscriptionStatus::Paused,
            _ => SubscriptionStatus::Other(value),
        }
    }
}

impl From<&str> for SubscriptionStatus {
    fn from(value: &str) -> Self {
        SubscriptionStatus::from(value.to_string())
    }
}

impl From<SubscriptionStatus> for String {
    fn from(value: SubscriptionStatus) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row per user key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    #[serde(rename = "_id")]
    pub id: String,
    pub user_key: String,
    pub plan: Plan,
    pub status: SubscriptionStatus,
    pub external_customer_id: Option<String>,
    pub external_subscription_id: Option<String>,
    pub cancel_at_period_end: bool,
    pub current_period_end: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// The row a user without a subscription is treated as having.
    pub fn default_for(user_key: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: new_id(),
            user_key: user_key.to_string(),
            plan: Plan::Free,
            status: SubscriptionStatus::Active,
            external_customer_id: None,
            external_subscription_id: None,
            cancel_at_period_end: false,
            current_period_end: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial update for a subscription row. `None` leaves a field untouched;
/// `current_period_end: Some(None)` clears the period end.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubscriptionPatch {
    pub plan: Option<Plan>,
    pub status: Option<SubscriptionStatus>,
    pub external_customer_id: Option<String>,
    pub external_subscription_id: Option<String>,
    pub cancel_at_period_end: Option<bool>,
    pub current_period_end: Option<Option<DateTime<Utc>>>,
}

impl SubscriptionPatch {
    pub fn plan(plan: Plan) -> Self {
        Self {
            plan: Some(plan),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == SubscriptionPatch::default()
    }

    pub fn apply_to(&self, sub: &mut Subscription, now: DateTime<Utc>) {
        if let Some(plan) = self.plan {
            sub.plan = plan;
        }
        if let Some(status) = &self.status {
            sub.status = status.clone();
        }
        if let Some(id) = &self.external_customer_id {
            sub.external_customer_id = Some(id.clone());
        }
        if let Some(id) = &self.external_subscription_id {
            sub.external_subscription_id = Some(id.clone());
        }
        if let Some(flag) = self.cancel_at_period_end {
            sub.cancel_at_period_end = flag;
        }
        if let Some(end) = self.current_period_end {
            sub.current_period_end = end;
        }
        sub.updated_at = now;
    }

    /// Fresh row for `user_key` with this patch applied over the defaults.
    pub fn new_subscription(&self, user_key: &str, now: DateTime<Utc>) -> Subscription {
        let mut sub = Subscription::default_for(user_key, now);
        self.apply_to(&mut sub, now);
        sub
    }
}

/// Provider event ids that were already applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEventRecord {
    #[serde(rename = "_id")]
    pub event_id: String,
    pub event_type: String,
    pub processed_at: DateTime<Utc>,
}
