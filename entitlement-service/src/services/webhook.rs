//! Payment processor webhooks applied to the subscription ledger.

use super::error::EntitlementError;
use super::ledger::SubscriptionLedger;
use super::metrics;
use super::repository::EntitlementRepository;
use crate::models::{Plan, SubscriptionPatch, SubscriptionStatus, WebhookEventRecord};
use chrono::{DateTime, TimeZone, Utc};
use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use service_core::utils::signature::{constant_time_eq, hmac_sha256_hex};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub const SIGNATURE_HEADER: &str = "Stripe-Signature";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookEventType {
    CheckoutSessionCompleted,
    SubscriptionUpdated,
    SubscriptionDeleted,
    Unknown(String),
}

impl From<&str> for WebhookEventType {
    fn from(s: &str) -> Self {
        match s {
            "checkout.session.completed" => Self::CheckoutSessionCompleted,
            "customer.subscription.updated" => Self::SubscriptionUpdated,
            "customer.subscription.deleted" => Self::SubscriptionDeleted,
            other => Self::Unknown(other.to_string()),
        }
    }
}

impl WebhookEventType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::CheckoutSessionCompleted => "checkout.session.completed",
            Self::SubscriptionUpdated => "customer.subscription.updated",
            Self::SubscriptionDeleted => "customer.subscription.deleted",
            Self::Unknown(s) => s,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WebhookEvent {
    pub id: String,
    pub event_type: WebhookEventType,
    pub object: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Processed,
    Duplicate,
    Ignored,
    /// Event was valid but its precondition did not hold.
    Skipped(String),
    /// Processing failed after verification; the event is still acknowledged.
    Failed(String),
}

impl WebhookOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processed => "processed",
            Self::Duplicate => "duplicate",
            Self::Ignored => "ignored",
            Self::Skipped(_) => "skipped",
            Self::Failed(_) => "failed",
        }
    }
}

#[derive(Deserialize)]
struct RawEvent {
    #[serde(default)]
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: RawEventData,
}

#[derive(Deserialize)]
struct RawEventData {
    object: serde_json::Value,
}

#[derive(Deserialize)]
struct CheckoutSession {
    customer: Option<String>,
    subscription: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Deserialize)]
struct SubscriptionObject {
    id: String,
    status: String,
    #[serde(default)]
    cancel_at_period_end: bool,
    current_period_end: Option<i64>,
}

#[derive(Clone)]
pub struct PaymentWebhookProcessor {
    ledger: SubscriptionLedger,
    repo: Arc<dyn EntitlementRepository>,
    secret: Option<Secret<String>>,
    tolerance_seconds: i64,
}

impl PaymentWebhookProcessor {
    pub fn new(
        ledger: SubscriptionLedger,
        repo: Arc<dyn EntitlementRepository>,
        secret: Option<Secret<String>>,
        tolerance_seconds: i64,
    ) -> Self {
        Self {
            ledger,
            repo,
            secret,
            tolerance_seconds,
        }
    }

    /// Verify, parse and apply one delivery. Only verification and envelope
    /// parse failures are errors; everything after that is acknowledged.
    pub async fn handle(
        &self,
        payload: &[u8],
        signature: Option<&str>,
    ) -> Result<WebhookOutcome, EntitlementError> {
        let now = Utc::now();
        let event = self.verify_and_parse(payload, signature, now)?;
        Ok(self.apply(event, now).await)
    }

    pub fn verify_and_parse(
        &self,
        payload: &[u8],
        signature: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<WebhookEvent, EntitlementError> {
        match (signature, &self.secret) {
            (Some(header), Some(secret)) => {
                self.verify_signature(payload, header, secret.expose_secret(), now)?
            }
            (None, Some(_)) => {
                warn!("Webhook received without signature header");
                return Err(EntitlementError::InvalidSignature(
                    "missing signature".to_string(),
                ));
            }
            _ => debug!("No webhook secret configured; accepting unverified payload"),
        }

        let raw: RawEvent = serde_json::from_slice(payload)
            .map_err(|e| EntitlementError::InvalidPayload(e.to_string()))?;

        debug!(event_id = %raw.id, event_type = %raw.event_type, "Parsed webhook event");

        Ok(WebhookEvent {
            id: raw.id,
            event_type: WebhookEventType::from(raw.event_type.as_str()),
            object: raw.data.object,
        })
    }

    fn verify_signature(
        &self,
        payload: &[u8],
        header: &str,
        secret: &str,
        now: DateTime<Utc>,
    ) -> Result<(), EntitlementError> {
        let mut timestamp: Option<&str> = None;
        let mut candidates: Vec<&str> = Vec::new();

        for part in header.split(',') {
            if let Some((key, value)) = part.trim().split_once('=') {
                match key {
                    "t" => timestamp = Some(value),
                    "v1" => candidates.push(value),
                    _ => {}
                }
            }
        }

        let timestamp = timestamp
            .ok_or_else(|| EntitlementError::InvalidSignature("missing timestamp".to_string()))?;
        if candidates.is_empty() {
            return Err(EntitlementError::InvalidSignature("missing v1 signature".to_string()));
        }

        let sent_at: i64 = timestamp
            .parse()
            .map_err(|_| EntitlementError::InvalidSignature("invalid timestamp".to_string()))?;
        if (now.timestamp() - sent_at).abs() > self.tolerance_seconds {
            warn!(sent_at, "Webhook timestamp outside tolerance");
            return Err(EntitlementError::InvalidSignature(
                "timestamp outside tolerance".to_string(),
            ));
        }

        let mut signed_payload = format!("{}.", timestamp).into_bytes();
        signed_payload.extend_from_slice(payload);
        let expected = hmac_sha256_hex(secret, &signed_payload)
            .map_err(|e| EntitlementError::Storage(e.context("HMAC init failed")))?;

        if candidates.iter().any(|c| constant_time_eq(&expected, c)) {
            Ok(())
        } else {
            warn!("Webhook signature mismatch");
            Err(EntitlementError::InvalidSignature("signature mismatch".to_string()))
        }
    }

    /// Apply a verified event, swallowing processing errors.
    pub async fn apply(&self, event: WebhookEvent, now: DateTime<Utc>) -> WebhookOutcome {
        let event_type = event.event_type.as_str().to_string();

        if !event.id.is_empty() {
            match self.repo.is_webhook_event_processed(&event.id).await {
                Ok(true) => {
                    info!(event_id = %event.id, "Duplicate webhook delivery ignored");
                    metrics::record_webhook_event(&event_type, "duplicate");
                    return WebhookOutcome::Duplicate;
                }
                Ok(false) => {}
                Err(e) => warn!(error = %e, event_id = %event.id, "Webhook dedupe lookup failed"),
            }
        }

        let event_id = event.id.clone();
        let outcome = match self.process(event, now).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(event_id = %event_id, event_type = %event_type, error = %e, "Webhook processing failed");
                WebhookOutcome::Failed(e.to_string())
            }
        };

        if outcome == WebhookOutcome::Processed && !event_id.is_empty() {
            let record = WebhookEventRecord {
                event_id: event_id.clone(),
                event_type: event_type.clone(),
                processed_at: now,
            };
            if let Err(e) = self.repo.record_webhook_event(&record).await {
                warn!(error = %e, event_id = %event_id, "Failed to record processed webhook event");
            }
        }

        metrics::record_webhook_event(&event_type, outcome.as_str());
        outcome
    }

    async fn process(
        &self,
        event: WebhookEvent,
        now: DateTime<Utc>,
    ) -> Result<WebhookOutcome, EntitlementError> {
        match event.event_type {
            WebhookEventType::CheckoutSessionCompleted => {
                let session: CheckoutSession = parse_object(event.object)?;
                self.on_checkout_completed(session, now).await
            }
            WebhookEventType::SubscriptionUpdated => {
                let sub: SubscriptionObject = parse_object(event.object)?;
                let patch = SubscriptionPatch {
                    status: Some(SubscriptionStatus::from(sub.status)),
                    cancel_at_period_end: Some(sub.cancel_at_period_end),
                    current_period_end: Some(sub.current_period_end.and_then(from_unix)),
                    ..Default::default()
                };
                self.apply_to_external(&sub.id, &patch, now).await
            }
            WebhookEventType::SubscriptionDeleted => {
                let sub: SubscriptionObject = parse_object(event.object)?;
                let patch = SubscriptionPatch {
                    plan: Some(Plan::Free),
                    status: Some(SubscriptionStatus::from(sub.status)),
                    ..Default::default()
                };
                self.apply_to_external(&sub.id, &patch, now).await
            }
            WebhookEventType::Unknown(kind) => {
                debug!(event_type = %kind, "Unhandled webhook event type");
                Ok(WebhookOutcome::Ignored)
            }
        }
    }

    async fn on_checkout_completed(
        &self,
        session: CheckoutSession,
        now: DateTime<Utc>,
    ) -> Result<WebhookOutcome, EntitlementError> {
        let user_key = ["user_key", "user_email", "email"]
            .iter()
            .find_map(|k| session.metadata.get(*k))
            .filter(|v| !v.trim().is_empty());
        let (Some(user_key), Some(plan)) = (user_key, session.metadata.get("plan")) else {
            warn!("Checkout completed without user key or plan metadata");
            return Ok(WebhookOutcome::Skipped(
                "checkout metadata missing user key or plan".to_string(),
            ));
        };

        let plan: Plan = plan
            .parse()
            .map_err(|e: crate::models::PlanParseError| EntitlementError::Validation(e.to_string()))?;

        let patch = SubscriptionPatch {
            plan: Some(plan),
            status: Some(SubscriptionStatus::Active),
            external_customer_id: session.customer,
            external_subscription_id: session.subscription,
            ..Default::default()
        };
        let sub = self.ledger.upsert_at(user_key, &patch, now).await?;
        info!(user_key = %sub.user_key, plan = %sub.plan, "Checkout completed, subscription activated");
        Ok(WebhookOutcome::Processed)
    }

    async fn apply_to_external(
        &self,
        external_subscription_id: &str,
        patch: &SubscriptionPatch,
        now: DateTime<Utc>,
    ) -> Result<WebhookOutcome, EntitlementError> {
        match self
            .ledger
            .update_by_external_subscription_id(external_subscription_id, patch, now)
            .await?
        {
            Some(sub) => {
                info!(
                    user_key = %sub.user_key,
                    status = %sub.status,
                    plan = %sub.plan,
                    "Subscription updated from webhook"
                );
                Ok(WebhookOutcome::Processed)
            }
            None => {
                warn!(external_subscription_id = %external_subscription_id, "No subscription for webhook event");
                Ok(WebhookOutcome::Skipped(format!(
                    "no subscription with external id {}",
                    external_subscription_id
                )))
            }
        }
    }
}

fn parse_object<T: serde::de::DeserializeOwned>(object: serde_json::Value) -> Result<T, EntitlementError> {
    serde_json::from_value(object).map_err(|e| EntitlementError::InvalidPayload(e.to_string()))
}

fn from_unix(seconds: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(seconds, 0).single()
}
