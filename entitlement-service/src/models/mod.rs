pub mod plan;
pub mod rate_limit;
pub mod referral;
pub mod special_account;
pub mod subscription;
pub mod trial;

pub use plan::{Plan, PlanParseError};
pub use rate_limit::{RateLimitAuditRecord, RateLimitDecision, RateLimitWindow};
pub use referral::{BonusType, Referral, ReferralStats, ReferralStatus};
pub use special_account::{AccountType, SpecialAccount};
pub use subscription::{
    Subscription, SubscriptionPatch, SubscriptionStatus, WebhookEventRecord,
    ADMIN_ADJUSTED_CUSTOMER_ID, EXEMPT_SPECIAL_CUSTOMER_ID,
};
pub use trial::Trial;

/// Emails are used as record keys everywhere, so they are compared lowercased.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
