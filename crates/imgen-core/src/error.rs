//! Error types for imgen domain logic.

use crate::ids::IdError;
use crate::job::JobState;
use crate::payment::PaymentState;

/// Result type for imgen domain operations.
pub type Result<T> = std::result::Result<T, BillingError>;

/// Errors raised by the pure domain rules (ledger arithmetic, state machines,
/// request validation).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BillingError {
    /// Not enough available credit to place a hold.
    #[error("insufficient credits: available={available}, required={required}")]
    InsufficientCredits {
        /// Credits currently available.
        available: i64,
        /// Credits the operation needs.
        required: i64,
    },

    /// An operation would break a ledger invariant (negative balance or
    /// releasing more than is held). This is a programming error.
    #[error("ledger invariant violated: {0}")]
    LedgerInvariant(String),

    /// Amounts must be strictly positive.
    #[error("invalid amount: {0}")]
    InvalidAmount(i64),

    /// The job state machine does not allow this edge.
    #[error("illegal job transition from {from:?} to {to:?}")]
    IllegalTransition {
        /// Persisted state.
        from: JobState,
        /// Requested state.
        to: JobState,
    },

    /// The payment intent state machine does not allow this edge.
    #[error("illegal payment transition from {from:?} to {to:?}")]
    IllegalPaymentTransition {
        /// Persisted state.
        from: PaymentState,
        /// Requested state.
        to: PaymentState,
    },

    /// The generation request failed validation.
    #[error("invalid generation request: {0}")]
    InvalidRequest(String),

    /// Invalid identifier.
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] IdError),
}
