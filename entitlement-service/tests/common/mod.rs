//! Shared setup for entitlement-service integration tests.
//!
//! Every test gets its own in-memory repository and hit counter, so tests
//! run in parallel without a database.

#![allow(dead_code)]

use axum::{
    body::Body,
    http::{HeaderMap, Request, StatusCode},
    Router,
};
use entitlement_service::{
    build_router,
    config::{
        EntitlementConfig, Environment, RateLimitConfig, ReferralConfig, SecurityConfig,
        TrialConfig, WebhookConfig,
    },
    models::BonusType,
    services::{
        EmailProvider, EntitlementRepository, HitCounter, InMemoryHitCounter, InMemoryRepository,
        MockEmailService, RateLimitAuditSink,
    },
    AppState,
};
use http_body_util::BodyExt;
use secrecy::Secret;
use serde_json::Value;
use service_core::middleware::signature::SignatureConfig;
use std::sync::Arc;
use tower::util::ServiceExt;

pub const WEBHOOK_SECRET: &str = "whsec_integration";
pub const SIGNING_CLIENT_ID: &str = "frontend";
pub const SIGNING_SECRET: &str = "integration-signing-secret";
pub const ADMIN_EMAIL: &str = "admin@example.com";

pub fn test_config() -> EntitlementConfig {
    EntitlementConfig {
        common: service_core::config::Config { port: 0 },
        environment: Environment::Dev,
        service_name: "entitlement-service-test".to_string(),
        service_version: "test".to_string(),
        log_level: "error".to_string(),
        otlp_endpoint: None,
        mongodb: None,
        redis: None,
        rate_limit: RateLimitConfig {
            fail_open: false,
            eviction_interval_seconds: 60,
        },
        webhook: WebhookConfig {
            secret: Some(Secret::new(WEBHOOK_SECRET.to_string())),
            tolerance_seconds: 300,
        },
        security: SecurityConfig {
            allowed_origins: vec!["http://localhost:3000".to_string()],
            signing_client_id: SIGNING_CLIENT_ID.to_string(),
            signing_secret: Secret::new(SIGNING_SECRET.to_string()),
            nonce_ttl_seconds: 300,
            signature_config: SignatureConfig {
                require_signatures: false,
                excluded_paths: vec![
                    "/health".to_string(),
                    "/ready".to_string(),
                    "/metrics".to_string(),
                    "/webhooks/payments".to_string(),
                ],
                max_clock_skew_seconds: 60,
            },
        },
        smtp: None,
        trial: TrialConfig {
            default_days: 7,
            max_days: 30,
        },
        referral: ReferralConfig { bonus_days: 30 },
    }
}

pub struct TestApp {
    pub state: AppState,
    pub repo: Arc<InMemoryRepository>,
    pub email: Arc<MockEmailService>,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: EntitlementConfig) -> Self {
        let repo = Arc::new(InMemoryRepository::new());
        let counter: Arc<dyn HitCounter> = Arc::new(InMemoryHitCounter::new());
        let email = Arc::new(MockEmailService::default());

        let provider: Arc<dyn EmailProvider> = email.clone();
        let entitlements: Arc<dyn EntitlementRepository> = repo.clone();
        let audit: Arc<dyn RateLimitAuditSink> = repo.clone();
        let state = AppState::new(&config, entitlements, audit, counter, Some(provider));

        Self { state, repo, email }
    }

    /// Pins the referral bonus instead of the coin flip.
    pub fn with_bonus(mut self, bonus: BonusType) -> Self {
        self.state.referrals = self
            .state
            .referrals
            .clone()
            .with_bonus_picker(Arc::new(move || bonus));
        self
    }

    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    pub async fn send(&self, req: Request<Body>) -> TestResponse {
        let res = self.router().oneshot(req).await.unwrap();
        let status = res.status();
        let headers = res.headers().clone();
        let bytes = res.into_body().collect().await.unwrap().to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        TestResponse {
            status,
            headers,
            body,
        }
    }
}

pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
}

/// JSON request with forwarded identity headers.
pub fn request_as(
    method: &str,
    uri: &str,
    email: Option<&str>,
    role: Option<&str>,
    body: Option<Value>,
) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(email) = email {
        builder = builder.header("X-User-Email", email);
    }
    if let Some(role) = role {
        builder = builder.header("X-User-Role", role);
    }
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

pub fn user_request(method: &str, uri: &str, email: &str, body: Option<Value>) -> Request<Body> {
    request_as(method, uri, Some(email), None, body)
}

pub fn admin_request(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
    request_as(method, uri, Some(ADMIN_EMAIL), Some("admin"), body)
}
