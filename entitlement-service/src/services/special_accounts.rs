use super::email::EmailProvider;
use super::error::EntitlementError;
use super::ledger::SubscriptionLedger;
use super::repository::{EntitlementRepository, InsertOutcome};
use crate::models::{
    new_id, normalize_email, AccountType, Plan, SpecialAccount, Subscription, SubscriptionPatch,
    SubscriptionStatus, EXEMPT_SPECIAL_CUSTOMER_ID,
};
use chrono::{DateTime, Utc};
use service_core::retry::{retry_with_backoff, RetryConfig};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct NewSpecialAccount {
    pub email: String,
    pub account_type: AccountType,
    pub tier: Plan,
    pub notes: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Admin-granted gift and development accounts, mirrored into the ledger.
#[derive(Clone)]
pub struct SpecialAccountService {
    repo: Arc<dyn EntitlementRepository>,
    ledger: SubscriptionLedger,
    email: Option<Arc<dyn EmailProvider>>,
    email_retry: RetryConfig,
}

impl SpecialAccountService {
    pub fn new(
        repo: Arc<dyn EntitlementRepository>,
        ledger: SubscriptionLedger,
        email: Option<Arc<dyn EmailProvider>>,
        email_retry: RetryConfig,
    ) -> Self {
        Self {
            repo,
            ledger,
            email,
            email_retry,
        }
    }

    pub async fn create(
        &self,
        request: NewSpecialAccount,
        admin_email: &str,
    ) -> Result<(SpecialAccount, Subscription), EntitlementError> {
        let email = normalize_email(&request.email);
        if email.is_empty() {
            return Err(EntitlementError::Validation("email is required".to_string()));
        }
        if !request.tier.is_paid() {
            return Err(EntitlementError::Validation(
                "Special accounts must grant a paid tier".to_string(),
            ));
        }
        if self.repo.find_special_account(&email).await?.is_some() {
            return Err(EntitlementError::Conflict(format!(
                "Special account already exists for {}",
                email
            )));
        }

        let now = Utc::now();
        let account = SpecialAccount {
            id: new_id(),
            email: email.clone(),
            account_type: request.account_type,
            tier: request.tier,
            is_active: true,
            notes: request.notes,
            created_by: normalize_email(admin_email),
            expires_at: request.expires_at,
            created_at: now,
        };

        if self.repo.insert_special_account(&account).await? == InsertOutcome::Duplicate {
            return Err(EntitlementError::Conflict(format!(
                "Special account already exists for {}",
                email
            )));
        }

        let patch = SubscriptionPatch {
            plan: Some(account.tier),
            status: Some(SubscriptionStatus::Active),
            external_customer_id: Some(EXEMPT_SPECIAL_CUSTOMER_ID.to_string()),
            cancel_at_period_end: Some(false),
            current_period_end: Some(account.expires_at),
            ..Default::default()
        };
        let subscription = self.ledger.upsert_at(&email, &patch, now).await?;

        tracing::info!(
            email = %email,
            account_type = %account.account_type,
            tier = %account.tier,
            admin = %account.created_by,
            "Special account created"
        );

        self.send_welcome(&account).await;
        Ok((account, subscription))
    }

    /// Best effort: the account already exists whether or not this lands.
    async fn send_welcome(&self, account: &SpecialAccount) {
        let Some(provider) = &self.email else {
            tracing::debug!(email = %account.email, "Email not configured, skipping welcome email");
            return;
        };

        let result = retry_with_backoff(&self.email_retry, "welcome_email", || {
            provider.send_welcome_email(&account.email, account.account_type, account.tier)
        })
        .await;

        if let Err(e) = result {
            tracing::warn!(email = %account.email, error = %e, "Welcome email not delivered");
        }
    }
}
