mod common;

use axum::http::StatusCode;
use common::{admin_request, request_as, user_request, TestApp, ADMIN_EMAIL};
use serde_json::json;

#[tokio::test]
async fn override_requires_admin_role() {
    let app = TestApp::new();
    let body = json!({ "target_email": "user@example.com", "new_tier": "pro", "reason": "support" });

    let res = app
        .send(user_request("POST", "/admin/entitlements", "user@example.com", Some(body.clone())))
        .await;
    assert_eq!(res.status, StatusCode::FORBIDDEN);
    assert_eq!(res.body["error"], "Admin access required");

    let res = app
        .send(request_as("POST", "/admin/entitlements", None, None, Some(body)))
        .await;
    assert_eq!(res.status, StatusCode::UNAUTHORIZED);

    assert_eq!(app.repo.subscription_count(), 0);
}

#[tokio::test]
async fn override_rejects_unknown_tier() {
    let app = TestApp::new();
    let res = app
        .send(admin_request(
            "POST",
            "/admin/entitlements",
            Some(json!({ "target_email": "user@example.com", "new_tier": "platinum", "reason": "x" })),
        ))
        .await;

    assert_eq!(res.status, StatusCode::BAD_REQUEST);
    assert_eq!(
        res.body["error"],
        "Invalid plan 'platinum'. Must be one of: free, pro, premium, family"
    );
    assert_eq!(app.repo.subscription_count(), 0);
}

#[tokio::test]
async fn override_rejects_invalid_email() {
    let app = TestApp::new();
    let res = app
        .send(admin_request(
            "POST",
            "/admin/entitlements",
            Some(json!({ "target_email": "not-an-email", "new_tier": "pro", "reason": "x" })),
        ))
        .await;

    assert_eq!(res.status, StatusCode::BAD_REQUEST);
    assert_eq!(res.body["error"], "target_email must be a valid email");
}

#[tokio::test]
async fn override_sets_plan_and_is_visible_to_user() {
    let app = TestApp::new();

    let res = app
        .send(admin_request(
            "POST",
            "/admin/entitlements",
            Some(json!({ "target_email": "User@Example.com", "new_tier": "premium", "reason": "refund dispute" })),
        ))
        .await;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.body["success"], true);
    assert_eq!(res.body["user_key"], "user@example.com");
    assert_eq!(res.body["plan"], "premium");

    let me = app
        .send(user_request("GET", "/subscriptions/me", "user@example.com", None))
        .await;
    assert_eq!(me.status, StatusCode::OK);
    assert_eq!(me.body["plan"], "premium");
    assert_eq!(me.body["effective_plan"], "premium");
    assert_eq!(me.body["subscription"]["status"], "active");
    assert_eq!(
        me.body["subscription"]["external_customer_id"],
        "admin_adjusted"
    );
}

#[tokio::test]
async fn repeated_override_keeps_one_subscription() {
    let app = TestApp::new();
    for tier in ["pro", "family", "free"] {
        let res = app
            .send(admin_request(
                "POST",
                "/admin/entitlements",
                Some(json!({ "target_email": "user@example.com", "new_tier": tier, "reason": "x" })),
            ))
            .await;
        assert_eq!(res.status, StatusCode::OK);
    }

    assert_eq!(app.repo.subscription_count(), 1);
    let me = app
        .send(user_request("GET", "/subscriptions/me", "user@example.com", None))
        .await;
    assert_eq!(me.body["plan"], "free");
}

#[tokio::test]
async fn subscription_defaults_to_free_without_a_row() {
    let app = TestApp::new();
    let me = app
        .send(user_request("GET", "/subscriptions/me", "nobody@example.com", None))
        .await;

    assert_eq!(me.status, StatusCode::OK);
    assert_eq!(me.body["plan"], "free");
    assert!(me.body["subscription"].is_null());
    assert_eq!(me.body["active_trials"], json!([]));
}

#[tokio::test]
async fn special_account_grants_tier_and_sends_welcome() {
    let app = TestApp::new();

    let res = app
        .send(admin_request(
            "POST",
            "/admin/special-accounts",
            Some(json!({
                "email": "tester@example.com",
                "account_type": "development",
                "tier": "family",
                "notes": "QA device farm"
            })),
        ))
        .await;

    assert_eq!(res.status, StatusCode::CREATED);
    assert_eq!(res.body["account"]["email"], "tester@example.com");
    assert_eq!(res.body["account"]["account_type"], "development");
    assert_eq!(res.body["account"]["created_by"], ADMIN_EMAIL);
    assert_eq!(res.body["account"]["is_active"], true);
    assert_eq!(app.email.sent_to(), vec!["tester@example.com".to_string()]);

    let me = app
        .send(user_request("GET", "/subscriptions/me", "tester@example.com", None))
        .await;
    assert_eq!(me.body["plan"], "family");
    assert_eq!(
        me.body["subscription"]["external_customer_id"],
        "exempt_special"
    );
}

#[tokio::test]
async fn duplicate_special_account_is_a_conflict() {
    let app = TestApp::new();
    let body = json!({ "email": "gift@example.com", "account_type": "gift", "tier": "pro" });

    let first = app
        .send(admin_request("POST", "/admin/special-accounts", Some(body.clone())))
        .await;
    assert_eq!(first.status, StatusCode::CREATED);

    let second = app
        .send(admin_request("POST", "/admin/special-accounts", Some(body)))
        .await;
    assert_eq!(second.status, StatusCode::CONFLICT);
    assert_eq!(app.email.sent_to().len(), 1);
}

#[tokio::test]
async fn special_account_rejects_bad_input() {
    let app = TestApp::new();

    let res = app
        .send(admin_request(
            "POST",
            "/admin/special-accounts",
            Some(json!({ "email": "x@example.com", "account_type": "vip", "tier": "pro" })),
        ))
        .await;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);

    let res = app
        .send(admin_request(
            "POST",
            "/admin/special-accounts",
            Some(json!({ "email": "x@example.com", "account_type": "gift", "tier": "free" })),
        ))
        .await;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);

    let res = app
        .send(user_request(
            "POST",
            "/admin/special-accounts",
            "x@example.com",
            Some(json!({ "email": "x@example.com", "account_type": "gift", "tier": "pro" })),
        ))
        .await;
    assert_eq!(res.status, StatusCode::FORBIDDEN);
}
