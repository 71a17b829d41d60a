//! Common test utilities for imgen integration tests.

#![allow(dead_code)] // Some utilities are used by different test files

use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderName, HeaderValue};
use axum::Router;
use axum_test::{TestRequest, TestServer};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use imgen_core::UserId;
use imgen_service::auth::JwtClaims;
use imgen_service::config::{JobSettings, ProviderConfig};
use imgen_service::{create_router, AppState, ServiceConfig};
use imgen_store::RocksStore;

pub const JWT_SECRET: &str = "test-jwt-secret";
pub const ADMIN_KEY: &str = "test-admin-key";

/// Test harness containing everything needed for integration tests.
pub struct TestHarness {
    /// The test server for making HTTP requests.
    pub server: TestServer,
    /// Shared state, for driving the reconcilers directly.
    pub state: AppState,
    /// Stand-in for the generation provider.
    pub provider: MockServer,
    /// Temporary directory for the database (kept alive for test duration).
    pub _temp_dir: TempDir,
    /// A test user ID for authenticated requests.
    pub test_user_id: UserId,
}

impl TestHarness {
    /// Create a new test harness with a fresh database.
    pub async fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let store = RocksStore::open(temp_dir.path()).expect("Failed to open store");
        let provider = MockServer::start().await;

        let config = ServiceConfig {
            listen_addr: "127.0.0.1:0".into(),
            data_dir: temp_dir.path().to_string_lossy().to_string(),
            auth_jwt_secret: Some(JWT_SECRET.into()),
            admin_api_key: Some(ADMIN_KEY.into()),
            provider: ProviderConfig {
                api_url: provider.uri(),
                api_key: Some("test-provider-key".into()),
                timeout_seconds: 5,
                ..ProviderConfig::default()
            },
            jobs: JobSettings {
                submit_backoff: Duration::from_millis(10),
                dispatch_grace: Duration::ZERO,
                ..JobSettings::default()
            },
            ..ServiceConfig::default()
        };

        let state = AppState::new(Arc::new(store), config).expect("Failed to build state");
        let router: Router = create_router(state.clone());

        let server = TestServer::new(router).expect("Failed to create test server");

        Self {
            server,
            state,
            provider,
            _temp_dir: temp_dir,
            test_user_id: UserId::generate(),
        }
    }

    /// Bearer token for the test user.
    pub fn user_token(&self) -> String {
        token_for(&self.test_user_id)
    }

    /// Attach the test user's credentials to a request.
    pub fn authed(&self, request: TestRequest) -> TestRequest {
        with_bearer(request, &self.user_token())
    }

    /// Attach admin credentials to a request.
    pub fn admin(request: TestRequest) -> TestRequest {
        request
            .add_header(
                HeaderName::from_static("x-admin-key"),
                HeaderValue::from_static(ADMIN_KEY),
            )
            .add_header(
                HeaderName::from_static("x-admin-id"),
                HeaderValue::from_static("ops"),
            )
    }

    /// Open the test user's account and grant it `amount` credits.
    pub async fn fund(&self, amount: i64) {
        self.authed(self.server.post("/v1/accounts")).await;
        Self::admin(self.server.post("/v1/credits/add"))
            .json(&json!({
                "user_id": self.test_user_id.to_string(),
                "amount": amount,
                "reason": "test"
            }))
            .await
            .assert_status_ok();
    }

    /// Make the provider accept every task as `task_id`.
    pub async fn accept_tasks(&self, task_id: &str) {
        Mock::given(method("POST"))
            .and(path("/api/v1/jobs/createTask"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 200,
                "msg": "success",
                "data": { "taskId": task_id }
            })))
            .mount(&self.provider)
            .await;
    }

    /// Make the provider report `record` for every status query.
    pub async fn report_record(&self, record: serde_json::Value) {
        Mock::given(method("GET"))
            .and(path("/api/v1/jobs/recordInfo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 200,
                "msg": "success",
                "data": record
            })))
            .mount(&self.provider)
            .await;
    }

    /// Poll `GET /v1/jobs/:id` until the job reaches `state`.
    pub async fn wait_for_job_state(&self, job_id: &str, state: &str) -> serde_json::Value {
        for _ in 0..200 {
            let body: serde_json::Value = self
                .authed(self.server.get(&format!("/v1/jobs/{job_id}")))
                .await
                .json();
            if body["state"] == state {
                return body;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {job_id} never reached {state}");
    }
}

/// Mint a token for `user_id`, valid for an hour.
pub fn token_for(user_id: &UserId) -> String {
    let now = chrono::Utc::now().timestamp();
    let claims = JwtClaims {
        sub: user_id.to_string(),
        exp: now + 3600,
        iat: now,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .unwrap()
}

/// Attach a bearer token to a request.
pub fn with_bearer(request: TestRequest, token: &str) -> TestRequest {
    request.add_header(
        HeaderName::from_static("authorization"),
        HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
    )
}
