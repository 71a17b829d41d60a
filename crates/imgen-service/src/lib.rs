//! imgen HTTP service.
//!
//! This crate provides the HTTP API and background machinery of imgen:
//!
//! - Ledger accounts, balances and history
//! - Image generation jobs handed to an external provider
//! - Bank-transfer top-ups matched from payment webhooks
//! - A worker that polls the provider and expires stale work
//!
//! # Authentication
//!
//! End-user requests carry an HS256 JWT whose `sub` is the user id. Admin
//! grants use the `X-Admin-Key` header. The payment webhook can require an
//! `Authorization: Apikey <key>` header.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
// Allow some pedantic lints that are noisy for Axum handler functions
#![allow(clippy::unused_async)] // Handlers need async for the router

pub mod analytics;
pub mod auth;
pub mod config;
pub mod crypto;
pub mod error;
pub mod handlers;
pub mod provider;
pub mod reconciler;
pub mod routes;
pub mod state;
pub mod worker;

pub use analytics::UsageReporter;
pub use config::ServiceConfig;
pub use error::ApiError;
pub use provider::{KieClient, ProviderError, ProviderGateway};
pub use reconciler::{JobReconciler, PaymentReconciler};
pub use routes::create_router;
pub use state::AppState;
pub use worker::Worker;
