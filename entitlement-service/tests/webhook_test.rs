mod common;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use chrono::Utc;
use common::{user_request, TestApp, WEBHOOK_SECRET};
use serde_json::{json, Value};
use service_core::utils::signature::hmac_sha256_hex;

fn stripe_signature(payload: &[u8], timestamp: i64, secret: &str) -> String {
    let mut signed = format!("{}.", timestamp).into_bytes();
    signed.extend_from_slice(payload);
    format!("t={},v1={}", timestamp, hmac_sha256_hex(secret, &signed).unwrap())
}

fn webhook(payload: &Value, signature: Option<String>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/webhooks/payments")
        .header("content-type", "application/json");
    if let Some(signature) = signature {
        builder = builder.header("Stripe-Signature", signature);
    }
    builder.body(Body::from(payload.to_string())).unwrap()
}

fn signed_webhook(payload: &Value) -> Request<Body> {
    let bytes = payload.to_string();
    let signature = stripe_signature(bytes.as_bytes(), Utc::now().timestamp(), WEBHOOK_SECRET);
    webhook(payload, Some(signature))
}

fn checkout_event(id: &str, email: &str, plan: &str) -> Value {
    json!({
        "id": id,
        "type": "checkout.session.completed",
        "data": { "object": {
            "customer": "cus_42",
            "subscription": "sub_42",
            "metadata": { "user_email": email, "plan": plan }
        }}
    })
}

#[tokio::test]
async fn signed_checkout_activates_plan() {
    let app = TestApp::new();

    let res = app
        .send(signed_webhook(&checkout_event("evt_1", "payer@example.com", "pro")))
        .await;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.body, json!({ "received": true }));

    let me = app
        .send(user_request("GET", "/subscriptions/me", "payer@example.com", None))
        .await;
    assert_eq!(me.body["plan"], "pro");
    assert_eq!(me.body["subscription"]["external_subscription_id"], "sub_42");
    assert_eq!(me.body["subscription"]["status"], "active");
}

#[tokio::test]
async fn bad_signature_is_rejected_without_changes() {
    let app = TestApp::new();
    let payload = checkout_event("evt_2", "payer@example.com", "pro");
    let bytes = payload.to_string();
    let forged = stripe_signature(bytes.as_bytes(), Utc::now().timestamp(), "whsec_wrong");

    let res = app.send(webhook(&payload, Some(forged))).await;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);
    assert_eq!(app.repo.subscription_count(), 0);
}

#[tokio::test]
async fn unsigned_delivery_is_rejected_when_secret_is_configured() {
    let app = TestApp::new();
    let payload = checkout_event("evt_4", "freeloader@example.com", "premium");

    let res = app.send(webhook(&payload, None)).await;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);
    assert_eq!(app.repo.subscription_count(), 0);

    let me = app
        .send(user_request("GET", "/subscriptions/me", "freeloader@example.com", None))
        .await;
    assert_eq!(me.body["plan"], "free");
}

#[tokio::test]
async fn stale_signature_is_rejected() {
    let app = TestApp::new();
    let payload = checkout_event("evt_3", "payer@example.com", "pro");
    let bytes = payload.to_string();
    let stale = stripe_signature(
        bytes.as_bytes(),
        Utc::now().timestamp() - 3600,
        WEBHOOK_SECRET,
    );

    let res = app.send(webhook(&payload, Some(stale))).await;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);
    assert_eq!(app.repo.subscription_count(), 0);
}

#[tokio::test]
async fn malformed_body_is_rejected() {
    let app = TestApp::new();
    let res = app.send(signed_webhook(&json!({ "hello": "world" }))).await;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn subscription_lifecycle_follows_events() {
    let app = TestApp::new();
    app.send(signed_webhook(&checkout_event("evt_10", "life@example.com", "premium")))
        .await;

    let period_end = Utc::now().timestamp() + 30 * 24 * 3600;
    let updated = json!({
        "id": "evt_11",
        "type": "customer.subscription.updated",
        "data": { "object": {
            "id": "sub_42",
            "status": "past_due",
            "cancel_at_period_end": true,
            "current_period_end": period_end
        }}
    });
    let res = app.send(signed_webhook(&updated)).await;
    assert_eq!(res.status, StatusCode::OK);

    let me = app
        .send(user_request("GET", "/subscriptions/me", "life@example.com", None))
        .await;
    assert_eq!(me.body["plan"], "premium");
    assert_eq!(me.body["subscription"]["status"], "past_due");
    assert_eq!(me.body["subscription"]["cancel_at_period_end"], true);

    let deleted = json!({
        "id": "evt_12",
        "type": "customer.subscription.deleted",
        "data": { "object": { "id": "sub_42", "status": "canceled" } }
    });
    app.send(signed_webhook(&deleted)).await;

    let me = app
        .send(user_request("GET", "/subscriptions/me", "life@example.com", None))
        .await;
    assert_eq!(me.body["plan"], "free");
    assert_eq!(me.body["subscription"]["status"], "canceled");
}

#[tokio::test]
async fn redelivered_event_is_applied_once() {
    let app = TestApp::new();
    let payload = checkout_event("evt_20", "twice@example.com", "pro");

    assert_eq!(app.send(signed_webhook(&payload)).await.status, StatusCode::OK);

    // An admin downgrade between deliveries must survive the redelivery.
    app.state
        .ledger
        .admin_override("twice@example.com", entitlement_service::models::Plan::Free, "test", "ops@example.com")
        .await
        .unwrap();

    assert_eq!(app.send(signed_webhook(&payload)).await.status, StatusCode::OK);
    let plan = app.state.ledger.get_plan("twice@example.com").await.unwrap();
    assert_eq!(plan, entitlement_service::models::Plan::Free);
}

#[tokio::test]
async fn redelivered_checkout_leaves_row_unchanged() {
    let app = TestApp::new();
    let payload = checkout_event("evt_21", "again@example.com", "premium");

    assert_eq!(app.send(signed_webhook(&payload)).await.status, StatusCode::OK);
    let before = app.state.ledger.get("again@example.com").await.unwrap();

    assert_eq!(app.send(signed_webhook(&payload)).await.status, StatusCode::OK);
    let after = app.state.ledger.get("again@example.com").await.unwrap();

    assert!(before.is_some());
    assert_eq!(before, after);
    assert_eq!(app.repo.subscription_count(), 1);
}

#[tokio::test]
async fn unknown_events_are_acknowledged() {
    let app = TestApp::new();
    let res = app
        .send(signed_webhook(&json!({
            "id": "evt_30",
            "type": "invoice.paid",
            "data": { "object": {} }
        })))
        .await;

    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(app.repo.subscription_count(), 0);
}

#[tokio::test]
async fn webhook_bypasses_request_signing() {
    let mut config = common::test_config();
    config.security.signature_config.require_signatures = true;
    let app = TestApp::with_config(config);

    let res = app
        .send(signed_webhook(&checkout_event("evt_40", "signed@example.com", "pro")))
        .await;
    assert_eq!(res.status, StatusCode::OK);
}
