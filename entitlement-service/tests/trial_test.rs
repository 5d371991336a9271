mod common;

use axum::http::StatusCode;
use chrono::{Duration, Utc};
use common::{user_request, TestApp};
use entitlement_service::models::Plan;
use serde_json::json;

#[tokio::test]
async fn trial_is_granted_once_per_plan() {
    let app = TestApp::new();
    let email = "curious@example.com";

    let res = app
        .send(user_request("GET", "/trials/eligibility?plan=premium", email, None))
        .await;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.body["eligible"], true);

    let res = app
        .send(user_request("POST", "/trials", email, Some(json!({ "plan": "premium" }))))
        .await;
    assert_eq!(res.status, StatusCode::CREATED);
    assert_eq!(res.body["trial_plan"], "premium");
    assert_eq!(res.body["user_email"], email);
    assert_eq!(res.body["is_active"], true);

    let res = app
        .send(user_request("POST", "/trials", email, Some(json!({ "plan": "premium" }))))
        .await;
    assert_eq!(res.status, StatusCode::CONFLICT);

    let res = app
        .send(user_request("GET", "/trials/eligibility?plan=premium", email, None))
        .await;
    assert_eq!(res.body["eligible"], false);

    // A different plan is still available.
    let res = app
        .send(user_request("POST", "/trials", email, Some(json!({ "plan": "family", "days": 14 }))))
        .await;
    assert_eq!(res.status, StatusCode::CREATED);
}

#[tokio::test]
async fn trial_duration_defaults_and_bounds() {
    let app = TestApp::new();

    let res = app
        .send(user_request("POST", "/trials", "d@example.com", Some(json!({ "plan": "pro" }))))
        .await;
    let start: chrono::DateTime<Utc> = serde_json::from_value(res.body["trial_start"].clone()).unwrap();
    let end: chrono::DateTime<Utc> = serde_json::from_value(res.body["trial_end"].clone()).unwrap();
    assert_eq!(end - start, Duration::days(7));

    let res = app
        .send(user_request("POST", "/trials", "e@example.com", Some(json!({ "plan": "pro", "days": 31 }))))
        .await;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);

    let res = app
        .send(user_request("POST", "/trials", "e@example.com", Some(json!({ "plan": "pro", "days": 0 }))))
        .await;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn free_plan_has_no_trial() {
    let app = TestApp::new();

    let res = app
        .send(user_request("POST", "/trials", "f@example.com", Some(json!({ "plan": "free" }))))
        .await;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);

    let res = app
        .send(user_request("GET", "/trials/eligibility?plan=free", "f@example.com", None))
        .await;
    assert_eq!(res.body["eligible"], false);
}

#[tokio::test]
async fn active_trial_raises_effective_plan_only() {
    let app = TestApp::new();
    let email = "mixed@example.com";
    app.send(user_request("POST", "/trials", email, Some(json!({ "plan": "family" }))))
        .await;

    let me = app
        .send(user_request("GET", "/subscriptions/me", email, None))
        .await;
    assert_eq!(me.body["plan"], "free");
    assert_eq!(me.body["effective_plan"], "family");
    assert_eq!(me.body["active_trials"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn sweep_deactivates_expired_trials() {
    let app = TestApp::new();
    let email = "expired@example.com";
    let started = Utc::now() - Duration::days(10);
    app.state
        .trials
        .start_trial_at(email, Plan::Pro, Some(3), started)
        .await
        .unwrap();

    let res = app
        .send(user_request("POST", "/trials/sweep", email, None))
        .await;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.body["deactivated"], 1);

    let res = app
        .send(user_request("POST", "/trials/sweep", email, None))
        .await;
    assert_eq!(res.body["deactivated"], 0);

    // The expired trial still counts as used.
    let res = app
        .send(user_request("GET", "/trials/eligibility?plan=pro", email, None))
        .await;
    assert_eq!(res.body["eligible"], false);
}
