//! Reconcilers: the only code that mutates jobs and payment intents.
//!
//! [`JobReconciler`] drives generation jobs from submission to a terminal
//! state and applies exactly one ledger effect per job. [`PaymentReconciler`]
//! matches bank-transfer webhooks to payment intents and credits the ledger
//! exactly once per payment. Both rely on the store's compare-and-swap
//! transitions and its idempotency guard, so concurrent workers and replayed
//! deliveries are safe.

pub mod jobs;
pub mod payments;

pub use jobs::{JobReconciler, Observation};
pub use payments::{PaymentReconciler, WebhookOutcome};

use imgen_core::BillingError;
use imgen_store::StoreError;

use crate::provider::ProviderError;

/// Failure shown to users for failed or expired jobs.
pub const GENERATION_FAILED_MESSAGE: &str = "generation failed, credit refunded";

/// Failure shown to senders of unmatched payments.
pub const PAYMENT_NOT_RECOGNIZED_MESSAGE: &str = "payment not recognized";

/// Errors raised while reconciling.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// Storage failed or refused the change.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A domain rule rejected the input.
    #[error(transparent)]
    Billing(#[from] BillingError),

    /// The provider could not be reached or refused the call.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// The referenced job or intent does not exist.
    #[error("not found: {0}")]
    NotFound(String),
}
