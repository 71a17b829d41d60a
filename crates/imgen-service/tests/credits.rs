//! Credit balance, history and admin grant integration tests.

mod common;

use std::time::Duration;

use axum::http::{HeaderName, HeaderValue, StatusCode};
use common::TestHarness;
use serde_json::json;

// ============================================================================
// Balance
// ============================================================================

#[tokio::test]
async fn get_balance_success() {
    let harness = TestHarness::new().await;
    harness.fund(300).await;

    let response = harness
        .authed(harness.server.get("/v1/credits/balance"))
        .await;

    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["available"], 300);
    assert_eq!(body["held"], 0);
}

#[tokio::test]
async fn get_balance_without_account_fails() {
    let harness = TestHarness::new().await;

    harness
        .authed(harness.server.get("/v1/credits/balance"))
        .await
        .assert_status_not_found();
}

#[tokio::test]
async fn get_balance_without_auth_fails() {
    let harness = TestHarness::new().await;

    harness
        .server
        .get("/v1/credits/balance")
        .await
        .assert_status_unauthorized();
}

// ============================================================================
// Transactions
// ============================================================================

#[tokio::test]
async fn list_transactions_empty() {
    let harness = TestHarness::new().await;
    harness.authed(harness.server.post("/v1/accounts")).await;

    let response = harness
        .authed(harness.server.get("/v1/credits/transactions"))
        .await;

    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert!(body["transactions"].as_array().unwrap().is_empty());
    assert_eq!(body["has_more"], false);
}

#[tokio::test]
async fn list_transactions_records_grants() {
    let harness = TestHarness::new().await;
    harness.fund(100).await;
    // Transaction ids order by millisecond.
    tokio::time::sleep(Duration::from_millis(5)).await;
    TestHarness::admin(harness.server.post("/v1/credits/add"))
        .json(&json!({
            "user_id": harness.test_user_id.to_string(),
            "amount": 50,
            "reason": "goodwill"
        }))
        .await
        .assert_status_ok();

    let response = harness
        .authed(harness.server.get("/v1/credits/transactions?limit=1&offset=0"))
        .await;

    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    let transactions = body["transactions"].as_array().unwrap();
    assert_eq!(transactions.len(), 1);
    assert_eq!(transactions[0]["amount"], 50);
    assert_eq!(body["has_more"], true);
}

// ============================================================================
// Admin Add Credits
// ============================================================================

#[tokio::test]
async fn admin_add_credits_success() {
    let harness = TestHarness::new().await;

    let response = TestHarness::admin(harness.server.post("/v1/credits/add"))
        .json(&json!({
            "user_id": harness.test_user_id.to_string(),
            "amount": 1000,
            "reason": "launch promo"
        }))
        .await;

    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["balance"], 1000);
    assert_eq!(body["held"], 0);
}

#[tokio::test]
async fn admin_add_credits_wrong_key_fails() {
    let harness = TestHarness::new().await;

    harness
        .server
        .post("/v1/credits/add")
        .add_header(
            HeaderName::from_static("x-admin-key"),
            HeaderValue::from_static("wrong-key"),
        )
        .json(&json!({
            "user_id": harness.test_user_id.to_string(),
            "amount": 1000,
            "reason": "nope"
        }))
        .await
        .assert_status_unauthorized();
}

#[tokio::test]
async fn admin_add_credits_rejects_non_positive_amount() {
    let harness = TestHarness::new().await;

    TestHarness::admin(harness.server.post("/v1/credits/add"))
        .json(&json!({
            "user_id": harness.test_user_id.to_string(),
            "amount": 0,
            "reason": "zero"
        }))
        .await
        .assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn user_token_cannot_grant_credits() {
    let harness = TestHarness::new().await;

    harness
        .authed(harness.server.post("/v1/credits/add"))
        .json(&json!({
            "user_id": harness.test_user_id.to_string(),
            "amount": 1000,
            "reason": "self-service"
        }))
        .await
        .assert_status_unauthorized();
}
