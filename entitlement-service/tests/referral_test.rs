mod common;

use axum::http::StatusCode;
use chrono::{DateTime, Duration, Utc};
use common::{admin_request, user_request, TestApp};
use entitlement_service::models::{BonusType, Plan};
use serde_json::{json, Value};

const REFERRER: &str = "referrer@example.com";

async fn code_for(app: &TestApp, email: &str) -> String {
    let res = app
        .send(user_request("GET", "/referrals/code", email, None))
        .await;
    assert_eq!(res.status, StatusCode::OK);
    res.body["referral_code"].as_str().unwrap().to_string()
}

async fn subscribe(app: &TestApp, email: &str) {
    app.state
        .ledger
        .upsert(email, &entitlement_service::models::SubscriptionPatch::plan(Plan::Pro))
        .await
        .unwrap();
}

async fn action(app: &TestApp, email: &str, body: Value) -> common::TestResponse {
    app.send(user_request("POST", "/referrals", email, Some(body)))
        .await
}

#[tokio::test]
async fn referral_code_is_stable() {
    let app = TestApp::new();
    let first = code_for(&app, REFERRER).await;
    let second = code_for(&app, REFERRER).await;

    assert_eq!(first, second);
    assert_eq!(first.len(), 8);
    assert!(first
        .chars()
        .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
}

#[tokio::test]
async fn signup_is_tracked_and_idempotent() {
    let app = TestApp::new();
    let code = code_for(&app, REFERRER).await;

    let res = action(
        &app,
        "friend@example.com",
        json!({ "action": "trackReferralSignup", "referral_code": code.to_lowercase() }),
    )
    .await;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.body["success"], true);
    assert_eq!(res.body["referral"]["status"], "signed_up");
    assert_eq!(res.body["referral"]["referrer_email"], REFERRER);
    let first_id = res.body["referral"]["_id"].clone();

    let again = action(
        &app,
        "friend@example.com",
        json!({ "action": "trackReferralSignup", "referral_code": code }),
    )
    .await;
    assert_eq!(again.status, StatusCode::OK);
    assert_eq!(again.body["referral"]["_id"], first_id);

    let stats = action(&app, REFERRER, json!({ "action": "getStats" })).await;
    assert_eq!(stats.body["total_referrals"], 1);
    assert_eq!(stats.body["signed_up"], 1);
}

#[tokio::test]
async fn invalid_and_self_referrals_are_rejected() {
    let app = TestApp::new();
    let code = code_for(&app, REFERRER).await;

    let res = action(
        &app,
        "friend@example.com",
        json!({ "action": "trackReferralSignup", "referral_code": "NOPE0000" }),
    )
    .await;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);

    let res = action(
        &app,
        REFERRER,
        json!({ "action": "trackReferralSignup", "referral_code": code }),
    )
    .await;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);

    let res = action(&app, "friend@example.com", json!({ "action": "trackReferralSignup" })).await;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);
    assert_eq!(res.body["error"], "referral_code is required");
}

#[tokio::test]
async fn unknown_action_is_a_bad_request() {
    let app = TestApp::new();
    let res = action(&app, REFERRER, json!({ "action": "doubleBonus" })).await;

    assert_eq!(res.status, StatusCode::BAD_REQUEST);
    assert_eq!(res.body["error"], "Unknown action: doubleBonus");
}

#[tokio::test]
async fn acting_for_another_user_needs_admin() {
    let app = TestApp::new();
    let code = code_for(&app, REFERRER).await;
    let body = json!({
        "action": "trackReferralSignup",
        "referral_code": code,
        "referred_email": "someone@example.com"
    });

    let res = action(&app, "mallory@example.com", body.clone()).await;
    assert_eq!(res.status, StatusCode::FORBIDDEN);

    let res = app
        .send(admin_request("POST", "/referrals", Some(body)))
        .await;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.body["referral"]["referred_email"], "someone@example.com");
}

#[tokio::test]
async fn reward_without_signup_is_not_found() {
    let app = TestApp::new();
    subscribe(&app, "stranger@example.com").await;
    let res = action(&app, "stranger@example.com", json!({ "action": "rewardReferrer" })).await;
    assert_eq!(res.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn reward_is_refused_until_referred_user_pays() {
    let app = TestApp::new().with_bonus(BonusType::FreeMonth);
    let code = code_for(&app, REFERRER).await;
    action(
        &app,
        "friend@example.com",
        json!({ "action": "trackReferralSignup", "referral_code": code }),
    )
    .await;

    let res = action(&app, "friend@example.com", json!({ "action": "rewardReferrer" })).await;
    assert_eq!(res.status, StatusCode::FORBIDDEN);

    let stats = action(&app, REFERRER, json!({ "action": "getStats" })).await;
    assert_eq!(stats.body["rewarded"], 0);
    assert_eq!(stats.body["signed_up"], 1);
    let res = app
        .send(user_request("POST", "/referrals/apply-bonus", REFERRER, None))
        .await;
    assert_eq!(res.body["applied"], false);

    subscribe(&app, "friend@example.com").await;
    let res = action(&app, "friend@example.com", json!({ "action": "rewardReferrer" })).await;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.body["referral"]["status"], "rewarded");
}

#[tokio::test]
async fn free_month_bonus_extends_period_exactly_once() {
    let app = TestApp::new().with_bonus(BonusType::FreeMonth);
    let code = code_for(&app, REFERRER).await;

    let before_end = app
        .state
        .ledger
        .extend_period(REFERRER, Duration::days(10), Utc::now())
        .await
        .unwrap()
        .current_period_end
        .unwrap();

    action(
        &app,
        "friend@example.com",
        json!({ "action": "trackReferralSignup", "referral_code": code }),
    )
    .await;
    subscribe(&app, "friend@example.com").await;

    let res = action(&app, "friend@example.com", json!({ "action": "rewardReferrer" })).await;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.body["referral"]["status"], "rewarded");
    assert_eq!(res.body["referral"]["bonus_type"], "free_month");
    assert_eq!(res.body["referral"]["bonus_applied"], false);

    // The same referral cannot be rewarded twice.
    let res = action(&app, "friend@example.com", json!({ "action": "rewardReferrer" })).await;
    assert_eq!(res.status, StatusCode::NOT_FOUND);

    let res = app
        .send(user_request("POST", "/referrals/apply-bonus", REFERRER, None))
        .await;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.body["applied"], true);
    assert_eq!(res.body["bonus_type"], "free_month");
    let new_end: DateTime<Utc> =
        serde_json::from_value(res.body["current_period_end"].clone()).unwrap();
    assert_eq!(new_end - before_end, Duration::days(30));

    let res = app
        .send(user_request("POST", "/referrals/apply-bonus", REFERRER, None))
        .await;
    assert_eq!(res.body["applied"], false);

    let stats = action(&app, REFERRER, json!({ "action": "getStats" })).await;
    assert_eq!(stats.body["rewarded"], 1);
    assert_eq!(stats.body["bonuses_applied"], 1);
    assert_eq!(stats.body["bonuses_pending"], 0);
    assert_eq!(stats.body["referral_code"], code);
}

#[tokio::test]
async fn credit_bonus_leaves_period_untouched() {
    let app = TestApp::new().with_bonus(BonusType::Credit5);
    let code = code_for(&app, REFERRER).await;

    action(
        &app,
        "friend@example.com",
        json!({ "action": "trackReferralSignup", "referral_code": code }),
    )
    .await;
    subscribe(&app, "friend@example.com").await;
    action(&app, "friend@example.com", json!({ "action": "rewardReferrer" })).await;

    let res = app
        .send(user_request("POST", "/referrals/apply-bonus", REFERRER, None))
        .await;
    assert_eq!(res.body["applied"], true);
    assert_eq!(res.body["bonus_type"], "credit_5");
    assert!(res.body.get("current_period_end").is_none());
    assert!(app.state.ledger.get(REFERRER).await.unwrap().is_none());
}
