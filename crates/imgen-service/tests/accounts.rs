//! Account management integration tests.

mod common;

use axum::http::StatusCode;
use common::{token_for, with_bearer, TestHarness};
use imgen_core::UserId;

#[tokio::test]
async fn create_account_success() {
    let harness = TestHarness::new().await;

    let response = harness.authed(harness.server.post("/v1/accounts")).await;

    response.assert_status(StatusCode::CREATED);
    let body: serde_json::Value = response.json();
    assert_eq!(body["user_id"], harness.test_user_id.to_string());
    assert_eq!(body["balance"], 0);
    assert_eq!(body["held"], 0);
}

#[tokio::test]
async fn create_account_twice_conflicts() {
    let harness = TestHarness::new().await;

    harness
        .authed(harness.server.post("/v1/accounts"))
        .await
        .assert_status(StatusCode::CREATED);

    let response = harness.authed(harness.server.post("/v1/accounts")).await;

    response.assert_status(StatusCode::CONFLICT);
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"]["code"], "conflict");
}

#[tokio::test]
async fn get_account_success() {
    let harness = TestHarness::new().await;
    harness.fund(250).await;

    let response = harness.authed(harness.server.get("/v1/accounts/me")).await;

    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["balance"], 250);
    assert_eq!(body["lifetime_granted"], 250);
}

#[tokio::test]
async fn get_account_not_found() {
    let harness = TestHarness::new().await;

    let response = harness.authed(harness.server.get("/v1/accounts/me")).await;

    response.assert_status_not_found();
}

#[tokio::test]
async fn accounts_are_isolated_per_user() {
    let harness = TestHarness::new().await;
    harness.fund(500).await;

    let other = token_for(&UserId::generate());
    let response = with_bearer(harness.server.get("/v1/accounts/me"), &other).await;

    response.assert_status_not_found();
}

#[tokio::test]
async fn missing_token_is_unauthorized() {
    let harness = TestHarness::new().await;

    harness
        .server
        .get("/v1/accounts/me")
        .await
        .assert_status_unauthorized();
}

#[tokio::test]
async fn token_signed_with_other_secret_is_unauthorized() {
    use jsonwebtoken::{encode, EncodingKey, Header};

    let harness = TestHarness::new().await;
    let claims = imgen_service::auth::JwtClaims {
        sub: harness.test_user_id.to_string(),
        exp: chrono::Utc::now().timestamp() + 3600,
        iat: 0,
    };
    let forged = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(b"not-the-secret"),
    )
    .unwrap();

    with_bearer(harness.server.get("/v1/accounts/me"), &forged)
        .await
        .assert_status_unauthorized();
}
