//! Core types and domain rules for imgen.
//!
//! This crate provides the foundational types used throughout imgen:
//!
//! - **Identifiers**: `UserId`, `JobId`, `PaymentIntentId`, `TransactionId`
//! - **Ledger**: `LedgerAccount`, `CreditTransaction`, `TransactionType`
//! - **Jobs**: `GenerationJob`, `GenerationRequest`, `JobState`, `JobTransition`
//! - **Payments**: `PaymentIntent`, `PaymentState`, match-token extraction
//! - **Idempotency**: `EventKey`, `ProcessedEventRecord`
//! - **Pricing**: `PricingConfig`
//! - **Usage**: `UsageRecord`
//!
//! # Credit unit
//!
//! Credits are stored as `i64` in the smallest unit. A 1K generation costs
//! 100 credits with the default pricing.
//!
//! Everything here is pure: no I/O, no clocks other than `Utc::now()` stamps.
//! Persistence and concurrency control live in `imgen-store`.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod account;
pub mod credits;
pub mod error;
pub mod event;
pub mod ids;
pub mod job;
pub mod payment;
pub mod pricing;
pub mod usage;

pub use account::{CreditSource, LedgerAccount};
pub use credits::{CreditTransaction, TransactionType};
pub use error::{BillingError, Result};
pub use event::{EventKey, ProcessedEventRecord, SourceSystem};
pub use ids::{IdError, JobId, PaymentIntentId, TransactionId, UserId};
pub use job::{
    AspectRatio, GenerationJob, GenerationRequest, JobState, JobTransition, LedgerEffect,
    OutputFormat, Resolution,
};
pub use payment::{
    extract_match_tokens, generate_match_token, normalize_match_token, PaymentIntent, PaymentState,
};
pub use pricing::PricingConfig;
pub use usage::{UsageKind, UsageRecord};
