use super::repository::{EntitlementRepository, InsertOutcome, RateLimitAuditSink};
use crate::models::{
    BonusType, Plan, RateLimitAuditRecord, Referral, ReferralStatus, SpecialAccount,
    Subscription, SubscriptionPatch, Trial, WebhookEventRecord,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::TryStreamExt;
use mongodb::bson::{doc, to_bson, Bson, Document};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::{
    FindOneAndUpdateOptions, FindOptions, IndexOptions, ReturnDocument,
};
use mongodb::{Collection, Database, IndexModel};

const DUPLICATE_KEY: i32 = 11000;
const UPSERT_ATTEMPTS: usize = 2;
const EXTEND_ATTEMPTS: usize = 5;

#[derive(Clone)]
pub struct MongoRepository {
    subscriptions: Collection<Subscription>,
    special_accounts: Collection<SpecialAccount>,
    trials: Collection<Trial>,
    referrals: Collection<Referral>,
    audit: Collection<RateLimitAuditRecord>,
    webhook_events: Collection<WebhookEventRecord>,
}

impl MongoRepository {
    pub fn new(db: &Database) -> Self {
        Self {
            subscriptions: db.collection("subscriptions"),
            special_accounts: db.collection("special_accounts"),
            trials: db.collection("trials"),
            referrals: db.collection("referrals"),
            audit: db.collection("rate_limit_audit"),
            webhook_events: db.collection("webhook_events"),
        }
    }

    /// Unique indexes back the one-row-per-key guarantees.
    pub async fn init_indexes(&self) -> Result<()> {
        self.subscriptions
            .create_indexes(
                [
                    unique_index(doc! { "user_key": 1 }, "subscription_user_key_idx"),
                    IndexModel::builder()
                        .keys(doc! { "external_subscription_id": 1 })
                        .options(
                            IndexOptions::builder()
                                .name("subscription_external_id_idx".to_string())
                                .sparse(true)
                                .build(),
                        )
                        .build(),
                ],
                None,
            )
            .await?;

        self.special_accounts
            .create_indexes([unique_index(doc! { "email": 1 }, "special_account_email_idx")], None)
            .await?;

        self.trials
            .create_indexes(
                [unique_index(
                    doc! { "user_email": 1, "trial_plan": 1 },
                    "trial_user_plan_idx",
                )],
                None,
            )
            .await?;

        self.referrals
            .create_indexes(
                [
                    unique_index(
                        doc! { "referrer_email": 1, "referred_email": 1 },
                        "referral_pair_idx",
                    ),
                    IndexModel::builder()
                        .keys(doc! { "referral_code": 1 })
                        .options(
                            IndexOptions::builder()
                                .name("referral_code_idx".to_string())
                                .build(),
                        )
                        .build(),
                    IndexModel::builder()
                        .keys(doc! { "referred_email": 1, "status": 1 })
                        .options(
                            IndexOptions::builder()
                                .name("referral_referred_status_idx".to_string())
                                .build(),
                        )
                        .build(),
                ],
                None,
            )
            .await?;

        self.audit
            .create_indexes(
                [IndexModel::builder()
                    .keys(doc! { "subject": 1, "endpoint": 1, "timestamp": -1 })
                    .options(
                        IndexOptions::builder()
                            .name("rate_limit_audit_subject_idx".to_string())
                            .build(),
                    )
                    .build()],
                None,
            )
            .await?;

        tracing::info!("Entitlement service indexes initialized");
        Ok(())
    }

    async fn try_upsert_subscription(
        &self,
        user_key: &str,
        patch: &SubscriptionPatch,
        now: DateTime<Utc>,
    ) -> mongodb::error::Result<Option<Subscription>> {
        let mut set = patch_set_document(patch)?;
        set.insert("updated_at", to_bson(&now)?);

        // Defaults for a fresh row, minus whatever `$set` already writes.
        let mut on_insert = mongodb::bson::to_document(&Subscription::default_for(user_key, now))?;
        for key in set.keys() {
            on_insert.remove(key);
        }

        let options = FindOneAndUpdateOptions::builder()
            .upsert(true)
            .return_document(ReturnDocument::After)
            .build();

        self.subscriptions
            .find_one_and_update(
                doc! { "user_key": user_key },
                doc! { "$set": set, "$setOnInsert": on_insert },
                options,
            )
            .await
    }
}

#[async_trait]
impl EntitlementRepository for MongoRepository {
    async fn find_subscription(&self, user_key: &str) -> Result<Option<Subscription>> {
        Ok(self
            .subscriptions
            .find_one(doc! { "user_key": user_key }, None)
            .await?)
    }

    async fn upsert_subscription(
        &self,
        user_key: &str,
        patch: &SubscriptionPatch,
        now: DateTime<Utc>,
    ) -> Result<Subscription> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_upsert_subscription(user_key, patch, now).await {
                Ok(Some(sub)) => return Ok(sub),
                Ok(None) => {
                    return Err(anyhow::anyhow!(
                        "Upsert returned no document for {}",
                        user_key
                    ))
                }
                // Two concurrent upserts can both try the insert; the loser retries as an update.
                Err(e) if is_duplicate_key(&e) && attempt < UPSERT_ATTEMPTS => {
                    tracing::debug!(user_key = %user_key, "Upsert raced, retrying as update");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn extend_subscription_period(
        &self,
        user_key: &str,
        by: Duration,
        now: DateTime<Utc>,
    ) -> Result<Subscription> {
        // Compare-and-swap on the period end we read; a concurrent writer
        // makes the filter miss and we re-read.
        for attempt in 1..=EXTEND_ATTEMPTS {
            let current = match self.find_subscription(user_key).await? {
                Some(sub) => sub,
                None => {
                    self.upsert_subscription(user_key, &SubscriptionPatch::default(), now)
                        .await?
                }
            };
            let extended = current.current_period_end.unwrap_or(now) + by;

            let options = FindOneAndUpdateOptions::builder()
                .return_document(ReturnDocument::After)
                .build();
            let swapped = self
                .subscriptions
                .find_one_and_update(
                    doc! {
                        "user_key": user_key,
                        "current_period_end": to_bson(&current.current_period_end)?,
                    },
                    doc! { "$set": {
                        "current_period_end": to_bson(&extended)?,
                        "updated_at": to_bson(&now)?,
                    }},
                    options,
                )
                .await?;

            match swapped {
                Some(sub) => return Ok(sub),
                None => tracing::debug!(user_key = %user_key, attempt, "Period extension raced, retrying"),
            }
        }
        Err(anyhow::anyhow!(
            "Period extension for {} kept racing after {} attempts",
            user_key,
            EXTEND_ATTEMPTS
        ))
    }

    async fn update_subscription_by_external_id(
        &self,
        external_subscription_id: &str,
        patch: &SubscriptionPatch,
        now: DateTime<Utc>,
    ) -> Result<Option<Subscription>> {
        let mut set = patch_set_document(patch)?;
        set.insert("updated_at", to_bson(&now)?);

        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();

        Ok(self
            .subscriptions
            .find_one_and_update(
                doc! { "external_subscription_id": external_subscription_id },
                doc! { "$set": set },
                options,
            )
            .await?)
    }

    async fn find_special_account(&self, email: &str) -> Result<Option<SpecialAccount>> {
        Ok(self
            .special_accounts
            .find_one(doc! { "email": email }, None)
            .await?)
    }

    async fn insert_special_account(&self, account: &SpecialAccount) -> Result<InsertOutcome> {
        insert_unique(&self.special_accounts, account).await
    }

    async fn find_trial(&self, email: &str, plan: Plan) -> Result<Option<Trial>> {
        Ok(self
            .trials
            .find_one(
                doc! { "user_email": email, "trial_plan": plan.as_str() },
                None,
            )
            .await?)
    }

    async fn list_trials(&self, email: &str) -> Result<Vec<Trial>> {
        let cursor = self.trials.find(doc! { "user_email": email }, None).await?;
        Ok(cursor.try_collect().await?)
    }

    async fn insert_trial(&self, trial: &Trial) -> Result<InsertOutcome> {
        insert_unique(&self.trials, trial).await
    }

    async fn deactivate_trial(&self, trial_id: &str) -> Result<bool> {
        let result = self
            .trials
            .update_one(
                doc! { "_id": trial_id, "is_active": true },
                doc! { "$set": { "is_active": false } },
                None,
            )
            .await?;
        Ok(result.modified_count > 0)
    }

    async fn find_referral_by_code(&self, code: &str) -> Result<Option<Referral>> {
        Ok(self
            .referrals
            .find_one(doc! { "referral_code": code, "referred_email": Bson::Null }, None)
            .await?)
    }

    async fn find_referral_anchor(&self, referrer_email: &str) -> Result<Option<Referral>> {
        Ok(self
            .referrals
            .find_one(
                doc! { "referrer_email": referrer_email, "referred_email": Bson::Null },
                None,
            )
            .await?)
    }

    async fn find_referral(
        &self,
        referrer_email: &str,
        referred_email: &str,
    ) -> Result<Option<Referral>> {
        Ok(self
            .referrals
            .find_one(
                doc! { "referrer_email": referrer_email, "referred_email": referred_email },
                None,
            )
            .await?)
    }

    async fn insert_referral(&self, referral: &Referral) -> Result<InsertOutcome> {
        insert_unique(&self.referrals, referral).await
    }

    async fn list_referrals(&self, referrer_email: &str) -> Result<Vec<Referral>> {
        let options = FindOptions::builder().sort(doc! { "created_at": 1 }).build();
        let cursor = self
            .referrals
            .find(doc! { "referrer_email": referrer_email }, options)
            .await?;
        Ok(cursor.try_collect().await?)
    }

    async fn reward_referral(
        &self,
        referred_email: &str,
        bonus: BonusType,
        now: DateTime<Utc>,
    ) -> Result<Option<Referral>> {
        let options = FindOneAndUpdateOptions::builder()
            .sort(doc! { "created_at": 1 })
            .return_document(ReturnDocument::After)
            .build();
        let now = to_bson(&now)?;

        Ok(self
            .referrals
            .find_one_and_update(
                doc! {
                    "referred_email": referred_email,
                    "status": to_bson(&ReferralStatus::SignedUp)?,
                },
                doc! {
                    "$set": {
                        "status": to_bson(&ReferralStatus::Rewarded)?,
                        "bonus_type": to_bson(&bonus)?,
                        "bonus_applied": false,
                        "subscribed_at": now.clone(),
                        "rewarded_at": now,
                    }
                },
                options,
            )
            .await?)
    }

    async fn claim_referral_bonus(
        &self,
        referrer_email: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Referral>> {
        let options = FindOneAndUpdateOptions::builder()
            .sort(doc! { "created_at": 1 })
            .return_document(ReturnDocument::After)
            .build();

        Ok(self
            .referrals
            .find_one_and_update(
                doc! {
                    "referrer_email": referrer_email,
                    "status": to_bson(&ReferralStatus::Rewarded)?,
                    "bonus_applied": false,
                },
                doc! { "$set": { "bonus_applied": true, "bonus_applied_at": to_bson(&now)? } },
                options,
            )
            .await?)
    }

    async fn release_referral_bonus(&self, referral_id: &str) -> Result<()> {
        self.referrals
            .update_one(
                doc! { "_id": referral_id },
                doc! { "$set": { "bonus_applied": false, "bonus_applied_at": Bson::Null } },
                None,
            )
            .await?;
        Ok(())
    }

    async fn is_webhook_event_processed(&self, event_id: &str) -> Result<bool> {
        Ok(self
            .webhook_events
            .find_one(doc! { "_id": event_id }, None)
            .await?
            .is_some())
    }

    async fn record_webhook_event(&self, record: &WebhookEventRecord) -> Result<()> {
        // A concurrent redelivery may have recorded it first.
        insert_unique(&self.webhook_events, record).await?;
        Ok(())
    }
}

#[async_trait]
impl RateLimitAuditSink for MongoRepository {
    async fn append(&self, record: &RateLimitAuditRecord) -> Result<()> {
        self.audit.insert_one(record, None).await?;
        Ok(())
    }
}

fn unique_index(keys: Document, name: &str) -> IndexModel {
    IndexModel::builder()
        .keys(keys)
        .options(
            IndexOptions::builder()
                .name(name.to_string())
                .unique(true)
                .build(),
        )
        .build()
}

async fn insert_unique<T>(collection: &Collection<T>, value: &T) -> Result<InsertOutcome>
where
    T: serde::Serialize + Send + Sync,
{
    match collection.insert_one(value, None).await {
        Ok(_) => Ok(InsertOutcome::Inserted),
        Err(e) if is_duplicate_key(&e) => Ok(InsertOutcome::Duplicate),
        Err(e) => Err(e.into()),
    }
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(e)) => e.code == DUPLICATE_KEY,
        ErrorKind::Command(e) => e.code == DUPLICATE_KEY,
        _ => false,
    }
}

fn patch_set_document(patch: &SubscriptionPatch) -> mongodb::bson::ser::Result<Document> {
    let mut set = Document::new();
    if let Some(plan) = patch.plan {
        set.insert("plan", plan.as_str());
    }
    if let Some(status) = &patch.status {
        set.insert("status", status.as_str());
    }
    if let Some(id) = &patch.external_customer_id {
        set.insert("external_customer_id", id.as_str());
    }
    if let Some(id) = &patch.external_subscription_id {
        set.insert("external_subscription_id", id.as_str());
    }
    if let Some(flag) = patch.cancel_at_period_end {
        set.insert("cancel_at_period_end", flag);
    }
    if let Some(end) = patch.current_period_end {
        set.insert("current_period_end", to_bson(&end)?);
    }
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SubscriptionStatus;

    #[test]
    fn set_document_only_contains_patched_fields() {
        let patch = SubscriptionPatch {
            status: Some(SubscriptionStatus::Canceled),
            current_period_end: Some(None),
            ..Default::default()
        };
        let set = patch_set_document(&patch).unwrap();

        assert_eq!(set.get_str("status").unwrap(), "canceled");
        assert_eq!(set.get("current_period_end"), Some(&Bson::Null));
        assert!(!set.contains_key("plan"));
    }
}
