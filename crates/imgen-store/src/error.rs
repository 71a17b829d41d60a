//! Error types for imgen storage.

use imgen_core::BillingError;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur in storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// Serialization/deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Record not found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of record.
        entity: &'static str,
        /// Identifier that was looked up.
        id: String,
    },

    /// A record with the same unique key already exists.
    #[error("{entity} already exists: {id}")]
    AlreadyExists {
        /// Kind of record.
        entity: &'static str,
        /// Conflicting key.
        id: String,
    },

    /// Not enough available credit for a hold.
    #[error("insufficient credits: available={available}, required={required}")]
    InsufficientCredits {
        /// Available credits.
        available: i64,
        /// Required credits.
        required: i64,
    },

    /// The persisted state no longer matches the caller's expected state.
    #[error("stale {entity} transition: expected {expected}, found {actual}")]
    StaleTransition {
        /// Kind of record.
        entity: &'static str,
        /// State the caller expected.
        expected: &'static str,
        /// State actually persisted.
        actual: &'static str,
    },

    /// Duplicate event (idempotency check failed).
    #[error("duplicate event: {event_id}")]
    DuplicateEvent {
        /// The event that was duplicated.
        event_id: String,
    },

    /// The write would break a ledger invariant. The whole batch is dropped.
    #[error("ledger invariant violated: {0}")]
    LedgerInvariant(String),

    /// Amounts must be strictly positive.
    #[error("invalid amount: {0}")]
    InvalidAmount(i64),

    /// The state machine does not allow the requested edge.
    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    /// Caller supplied malformed data.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl StoreError {
    pub(crate) fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub(crate) fn db(err: impl std::fmt::Display) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<BillingError> for StoreError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::InsufficientCredits {
                available,
                required,
            } => Self::InsufficientCredits {
                available,
                required,
            },
            BillingError::LedgerInvariant(msg) => Self::LedgerInvariant(msg),
            BillingError::InvalidAmount(amount) => Self::InvalidAmount(amount),
            err @ (BillingError::IllegalTransition { .. }
            | BillingError::IllegalPaymentTransition { .. }) => {
                Self::InvalidTransition(err.to_string())
            }
            BillingError::InvalidRequest(msg) => Self::InvalidInput(msg),
            BillingError::InvalidId(err) => Self::InvalidInput(err.to_string()),
        }
    }
}
