//! Router configuration.
//!
//! This module sets up the Axum router with all routes and middleware.

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{accounts, credits, health, jobs, payments, webhooks};
use crate::state::AppState;

// ============================================================================
// Concurrency Limiting Constants
// ============================================================================

/// Maximum concurrent job submissions.
/// Each submission reserves credits and spawns a provider call.
const JOBS_MAX_CONCURRENT_REQUESTS: usize = 32;

/// Maximum concurrent requests for general API endpoints.
const API_MAX_CONCURRENT_REQUESTS: usize = 50;

/// Create the service router with all routes and middleware.
///
/// # Routes
///
/// ## Public
/// - `GET /health` - Health check
///
/// ## Accounts (JWT auth)
/// - `POST /v1/accounts` - Open a ledger account
/// - `GET /v1/accounts/me` - Get current user's account
///
/// ## Credits (JWT auth)
/// - `GET /v1/credits/balance` - Available and held credits
/// - `GET /v1/credits/transactions` - Ledger history
/// - `POST /v1/credits/add` - Manual grant (admin key)
///
/// ## Jobs (JWT auth, rate-limited)
/// - `POST /v1/jobs` - Submit a generation job
/// - `GET /v1/jobs/:id` - Job status
///
/// ## Payments (JWT auth)
/// - `POST /v1/payments/intents` - Announce a bank-transfer top-up
/// - `GET /v1/payments/intents/:id` - Intent status
///
/// ## Webhooks
/// - `POST /webhooks/payments` - Payment gateway notifications
/// - `POST /webhooks/provider` - Provider task callbacks
pub fn create_router(state: AppState) -> Router {
    // Extract config values before moving state
    let cors_origins = state.config.cors_origins.clone();
    let max_body_bytes = state.config.max_body_bytes;
    let request_timeout_seconds = state.config.request_timeout_seconds;

    let cors = build_cors_layer(&cors_origins);

    let state = Arc::new(state);

    let job_routes = Router::new()
        .route("/", post(jobs::submit_job))
        .route("/:id", get(jobs::get_job))
        .layer(ConcurrencyLimitLayer::new(JOBS_MAX_CONCURRENT_REQUESTS));

    let api_routes = Router::new()
        // Accounts
        .route("/accounts", post(accounts::create_account))
        .route("/accounts/me", get(accounts::get_account))
        // Credits
        .route("/credits/balance", get(credits::get_balance))
        .route("/credits/transactions", get(credits::list_transactions))
        .route("/credits/add", post(credits::admin_add_credits))
        // Payments
        .route("/payments/intents", post(payments::create_intent))
        .route("/payments/intents/:id", get(payments::get_intent))
        // Jobs (with their own concurrency limit)
        .nest("/jobs", job_routes)
        .layer(ConcurrencyLimitLayer::new(API_MAX_CONCURRENT_REQUESTS));

    Router::new()
        // Health (public, no rate limit)
        .route("/health", get(health::health))
        // API v1 routes (rate limited)
        .nest("/v1", api_routes)
        // Webhooks (no rate limit - controlled by external services)
        .route("/webhooks/payments", post(webhooks::payment_webhook))
        .route("/webhooks/provider", post(webhooks::provider_webhook))
        // Global middleware
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(TimeoutLayer::new(Duration::from_secs(
            request_timeout_seconds,
        )))
        .with_state(state)
}

/// Build the CORS layer from configured origins.
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}
