use super::error::EntitlementError;
use super::ledger::SubscriptionLedger;
use super::metrics;
use super::repository::{EntitlementRepository, InsertOutcome};
use crate::models::{
    new_id, normalize_email, BonusType, Referral, ReferralStats, ReferralStatus, Subscription,
};
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use std::sync::Arc;

const CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const CODE_LENGTH: usize = 8;
const CODE_ATTEMPTS: usize = 5;

pub type BonusPicker = Arc<dyn Fn() -> BonusType + Send + Sync>;

/// Unweighted coin flip between the two bonus kinds.
pub fn coin_flip_bonus() -> BonusType {
    if rand::thread_rng().gen_bool(0.5) {
        BonusType::FreeMonth
    } else {
        BonusType::Credit5
    }
}

fn generate_code() -> String {
    let mut rng = rand::thread_rng();
    (0..CODE_LENGTH)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

#[derive(Debug, Clone)]
pub struct AppliedBonus {
    pub referral: Referral,
    /// Set when the bonus extended the referrer's subscription.
    pub subscription: Option<Subscription>,
}

/// Referral pairs live in one row each, so every transition is a single
/// conditional write.
#[derive(Clone)]
pub struct ReferralRewardEngine {
    repo: Arc<dyn EntitlementRepository>,
    ledger: SubscriptionLedger,
    bonus_picker: BonusPicker,
    free_month: Duration,
}

impl ReferralRewardEngine {
    pub fn new(
        repo: Arc<dyn EntitlementRepository>,
        ledger: SubscriptionLedger,
        bonus_days: u32,
    ) -> Self {
        Self {
            repo,
            ledger,
            bonus_picker: Arc::new(coin_flip_bonus),
            free_month: Duration::days(i64::from(bonus_days)),
        }
    }

    pub fn with_bonus_picker(mut self, picker: BonusPicker) -> Self {
        self.bonus_picker = picker;
        self
    }

    /// The referrer's code, created on first request.
    pub async fn referral_code(&self, referrer_email: &str) -> Result<String, EntitlementError> {
        let referrer = normalize_email(referrer_email);
        if referrer.is_empty() {
            return Err(EntitlementError::Validation("email is required".to_string()));
        }
        if let Some(anchor) = self.repo.find_referral_anchor(&referrer).await? {
            return Ok(anchor.referral_code);
        }

        for _ in 0..CODE_ATTEMPTS {
            let code = generate_code();
            if self.repo.find_referral_by_code(&code).await?.is_some() {
                continue;
            }
            let anchor = Referral {
                id: new_id(),
                referrer_email: referrer.clone(),
                referral_code: code.clone(),
                referred_email: None,
                status: ReferralStatus::Pending,
                bonus_type: BonusType::None,
                bonus_applied: false,
                created_at: Utc::now(),
                signed_up_at: None,
                subscribed_at: None,
                rewarded_at: None,
                bonus_applied_at: None,
            };
            match self.repo.insert_referral(&anchor).await? {
                InsertOutcome::Inserted => {
                    tracing::info!(referrer = %referrer, "Referral code created");
                    return Ok(code);
                }
                // Another request created the anchor first.
                InsertOutcome::Duplicate => {
                    if let Some(existing) = self.repo.find_referral_anchor(&referrer).await? {
                        return Ok(existing.referral_code);
                    }
                }
            }
        }

        Err(EntitlementError::Storage(anyhow::anyhow!(
            "Could not allocate a unique referral code"
        )))
    }

    pub async fn track_signup(
        &self,
        code: &str,
        referred_email: &str,
    ) -> Result<Referral, EntitlementError> {
        self.track_signup_at(code, referred_email, Utc::now()).await
    }

    pub async fn track_signup_at(
        &self,
        code: &str,
        referred_email: &str,
        now: DateTime<Utc>,
    ) -> Result<Referral, EntitlementError> {
        let code = code.trim().to_uppercase();
        let referred = normalize_email(referred_email);
        if code.is_empty() || referred.is_empty() {
            return Err(EntitlementError::Validation(
                "referral code and referred email are required".to_string(),
            ));
        }

        let anchor = self
            .repo
            .find_referral_by_code(&code)
            .await?
            .ok_or(EntitlementError::InvalidReferralCode)?;
        if anchor.referrer_email == referred {
            return Err(EntitlementError::SelfReferral);
        }

        // Pair rows are created at signed_up, so an existing row is already
        // at or past that state and must not regress.
        if let Some(existing) = self.repo.find_referral(&anchor.referrer_email, &referred).await? {
            return Ok(existing);
        }

        let referral = Referral {
            id: new_id(),
            referrer_email: anchor.referrer_email.clone(),
            referral_code: code,
            referred_email: Some(referred.clone()),
            status: ReferralStatus::SignedUp,
            bonus_type: BonusType::None,
            bonus_applied: false,
            created_at: now,
            signed_up_at: Some(now),
            subscribed_at: None,
            rewarded_at: None,
            bonus_applied_at: None,
        };

        match self.repo.insert_referral(&referral).await? {
            InsertOutcome::Inserted => {
                tracing::info!(referrer = %referral.referrer_email, referred = %referred, "Referral signup tracked");
                metrics::record_referral_event("signed_up");
                Ok(referral)
            }
            InsertOutcome::Duplicate => self
                .repo
                .find_referral(&anchor.referrer_email, &referred)
                .await?
                .ok_or_else(|| {
                    EntitlementError::Storage(anyhow::anyhow!(
                        "Referral row vanished after duplicate insert"
                    ))
                }),
        }
    }

    pub async fn reward_referrer(&self, referred_email: &str) -> Result<Referral, EntitlementError> {
        self.reward_referrer_at(referred_email, Utc::now()).await
    }

    /// The referred user subscribed: move their signed-up referral to
    /// rewarded with a randomly chosen bonus. Refused while the referred
    /// user is still on the free plan.
    pub async fn reward_referrer_at(
        &self,
        referred_email: &str,
        now: DateTime<Utc>,
    ) -> Result<Referral, EntitlementError> {
        let referred = normalize_email(referred_email);
        if referred.is_empty() {
            return Err(EntitlementError::Validation(
                "referred email is required".to_string(),
            ));
        }

        if !self.ledger.get_plan(&referred).await?.is_paid() {
            tracing::warn!(referred = %referred, "Reward requested for referred user without a paid plan");
            return Err(EntitlementError::Forbidden(format!(
                "{} has no paid subscription",
                referred
            )));
        }

        let bonus = (self.bonus_picker)();
        let referral = self
            .repo
            .reward_referral(&referred, bonus, now)
            .await?
            .ok_or_else(|| {
                EntitlementError::NotFound(format!(
                    "No signed-up referral found for {}",
                    referred
                ))
            })?;

        tracing::info!(
            referrer = %referral.referrer_email,
            referred = %referred,
            bonus = %bonus,
            "Referrer rewarded"
        );
        metrics::record_referral_event("rewarded");
        Ok(referral)
    }

    pub async fn apply_referral_bonus(
        &self,
        referrer_email: &str,
    ) -> Result<Option<AppliedBonus>, EntitlementError> {
        self.apply_referral_bonus_at(referrer_email, Utc::now()).await
    }

    /// Consume one unapplied bonus. Returns `None` when nothing is owed.
    pub async fn apply_referral_bonus_at(
        &self,
        referrer_email: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<AppliedBonus>, EntitlementError> {
        let referrer = normalize_email(referrer_email);
        let Some(referral) = self.repo.claim_referral_bonus(&referrer, now).await? else {
            return Ok(None);
        };

        let subscription = match referral.bonus_type {
            BonusType::FreeMonth => {
                match self.ledger.extend_period(&referrer, self.free_month, now).await {
                    Ok(sub) => Some(sub),
                    Err(e) => {
                        if let Err(release_err) = self.repo.release_referral_bonus(&referral.id).await {
                            tracing::error!(
                                referral_id = %referral.id,
                                error = %release_err,
                                "Failed to release bonus claim after extension failure"
                            );
                        }
                        return Err(e);
                    }
                }
            }
            // Credits are settled by the payment processor.
            BonusType::Credit5 | BonusType::None => None,
        };

        tracing::info!(
            referrer = %referrer,
            referral_id = %referral.id,
            bonus = %referral.bonus_type,
            "Referral bonus applied"
        );
        metrics::record_referral_event("bonus_applied");
        Ok(Some(AppliedBonus {
            referral,
            subscription,
        }))
    }

    pub async fn stats(&self, referrer_email: &str) -> Result<ReferralStats, EntitlementError> {
        let referrer = normalize_email(referrer_email);
        let rows = self.repo.list_referrals(&referrer).await?;

        let mut stats = ReferralStats::default();
        for row in &rows {
            if row.is_anchor() {
                stats.referral_code = Some(row.referral_code.clone());
                continue;
            }
            stats.total_referrals += 1;
            if row.status.rank() >= ReferralStatus::SignedUp.rank() {
                stats.signed_up += 1;
            }
            if row.status == ReferralStatus::Rewarded {
                stats.rewarded += 1;
                if row.bonus_applied {
                    stats.bonuses_applied += 1;
                } else {
                    stats.bonuses_pending += 1;
                }
            }
        }
        Ok(stats)
    }
}
