//! `RocksDB` storage layer for imgen.
//!
//! This crate persists ledger accounts, credit transactions, generation jobs,
//! payment intents and processed-event records, and owns every atomicity
//! guarantee the service relies on.
//!
//! # Architecture
//!
//! The storage uses the following column families:
//!
//! - `accounts`: ledger accounts, keyed by `user_id`
//! - `transactions` / `transactions_by_user`: ledger history
//! - `jobs` / `jobs_by_task` / `live_jobs`: generation jobs and their indexes
//! - `payment_intents` / `intents_by_token` / `open_intents`: top-up intents
//! - `processed_events`: the idempotency guard
//!
//! Every compound operation takes its keys in the lock table, re-reads the
//! records it needs, and writes all changes in a single `WriteBatch`. A job
//! reaching a terminal state, its ledger effect and its processed-event record
//! therefore land together or not at all.
//!
//! # Example
//!
//! ```no_run
//! use imgen_store::{RocksStore, Store};
//! use imgen_core::{CreditSource, UserId};
//!
//! let store = RocksStore::open("/tmp/imgen-db").unwrap();
//!
//! let user_id = UserId::generate();
//! store.credit(&user_id, 500, CreditSource::Grant, None).unwrap();
//! store.hold(&user_id, 100, Some("job")).unwrap();
//!
//! let account = store.get_account(&user_id).unwrap().unwrap();
//! assert_eq!(account.balance, 400);
//! assert_eq!(account.held, 100);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod keys;
pub mod locks;
pub mod rocks;
pub mod schema;

pub use error::{Result, StoreError};
pub use rocks::RocksStore;

use imgen_core::{
    CreditSource, CreditTransaction, EventKey, GenerationJob, JobId, JobState, JobTransition,
    LedgerAccount, PaymentIntent, PaymentIntentId, PaymentState, ProcessedEventRecord,
    TransactionId, UserId,
};

/// A guarded payment intent state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntentTransition {
    /// Target state.
    pub to: PaymentState,
    /// Webhook event recorded atomically with the change.
    pub event: Option<EventKey>,
    /// Amount carried by the webhook.
    pub received_amount: Option<i64>,
}

/// The storage trait defining all database operations.
///
/// This trait abstracts the storage layer, allowing for different implementations
/// (e.g., `RocksDB`, in-memory for testing).
pub trait Store: Send + Sync {
    // =========================================================================
    // Ledger Operations
    // =========================================================================

    /// Get an account by user ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_account(&self, user_id: &UserId) -> Result<Option<LedgerAccount>>;

    /// Get the account, creating an empty one if the user has none.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn open_account(&self, user_id: &UserId) -> Result<LedgerAccount>;

    /// Move `amount` from the available balance into `held`.
    ///
    /// # Errors
    ///
    /// `InsufficientCredits` if the available balance is too low or the
    /// account does not exist.
    fn hold(&self, user_id: &UserId, amount: i64, reference: Option<&str>) -> Result<LedgerAccount>;

    /// Return `amount` from `held` to the available balance.
    ///
    /// # Errors
    ///
    /// `LedgerInvariant` if less than `amount` is held.
    fn release_hold(
        &self,
        user_id: &UserId,
        amount: i64,
        reference: Option<&str>,
    ) -> Result<LedgerAccount>;

    /// Consume `amount` of `held` permanently.
    ///
    /// # Errors
    ///
    /// `LedgerInvariant` if less than `amount` is held.
    fn settle_hold(
        &self,
        user_id: &UserId,
        amount: i64,
        reference: Option<&str>,
    ) -> Result<LedgerAccount>;

    /// Add `amount` to the available balance, creating the account if needed.
    ///
    /// # Errors
    ///
    /// `InvalidAmount` for non-positive amounts.
    fn credit(
        &self,
        user_id: &UserId,
        amount: i64,
        source: CreditSource,
        reference: Option<&str>,
    ) -> Result<LedgerAccount>;

    // =========================================================================
    // Transaction Operations
    // =========================================================================

    /// Get a transaction by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_transaction(&self, transaction_id: &TransactionId) -> Result<Option<CreditTransaction>>;

    /// List transactions for a user, ordered by time (newest first).
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_transactions_by_user(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<CreditTransaction>>;

    // =========================================================================
    // Job Operations
    // =========================================================================

    /// Persist a new job and place a hold of `job.cost_estimate` on the
    /// owner's account, atomically. Nothing is written if the hold fails.
    ///
    /// # Errors
    ///
    /// `InsufficientCredits` if the owner cannot cover the estimate.
    fn create_job(&self, job: &GenerationJob) -> Result<LedgerAccount>;

    /// Get a job by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_job(&self, job_id: &JobId) -> Result<Option<GenerationJob>>;

    /// Find the job a provider task belongs to.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_job_by_task(&self, provider: &str, task_id: &str) -> Result<Option<GenerationJob>>;

    /// Compare-and-swap a job from `from` through `transition`.
    ///
    /// Terminal transitions apply the hold settlement or release and, when
    /// `event` is given, record it in the idempotency guard, all in the same
    /// batch.
    ///
    /// # Errors
    ///
    /// - `StaleTransition` if the persisted state is not `from`.
    /// - `DuplicateEvent` if `event` was already recorded.
    /// - `InvalidTransition` if the state machine has no such edge.
    fn transition_job(
        &self,
        job_id: &JobId,
        from: JobState,
        transition: &JobTransition,
        event: Option<&EventKey>,
    ) -> Result<GenerationJob>;

    /// All jobs not yet in a terminal state.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_live_jobs(&self) -> Result<Vec<GenerationJob>>;

    /// Jobs in `Waiting` or `Processing`, i.e. the ones to poll.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_pending_jobs(&self) -> Result<Vec<GenerationJob>> {
        Ok(self
            .list_live_jobs()?
            .into_iter()
            .filter(|job| job.state.is_pending())
            .collect())
    }

    // =========================================================================
    // Payment Intent Operations
    // =========================================================================

    /// Persist a new intent and index its match token.
    ///
    /// # Errors
    ///
    /// `AlreadyExists` if another intent uses the same token.
    fn create_payment_intent(&self, intent: &PaymentIntent) -> Result<()>;

    /// Get an intent by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_payment_intent(&self, intent_id: &PaymentIntentId) -> Result<Option<PaymentIntent>>;

    /// Find an intent by its normalized match token.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_payment_intent_by_token(&self, match_token: &str) -> Result<Option<PaymentIntent>>;

    /// Compare-and-swap an intent from `from` to `transition.to`.
    ///
    /// # Errors
    ///
    /// - `StaleTransition` if the persisted state is not `from`.
    /// - `DuplicateEvent` if the transition's event was already recorded.
    fn transition_payment_intent(
        &self,
        intent_id: &PaymentIntentId,
        from: PaymentState,
        transition: &IntentTransition,
    ) -> Result<PaymentIntent>;

    /// Move a `Matched` intent to `Completed` and credit the owner by the
    /// expected amount, atomically.
    ///
    /// # Errors
    ///
    /// `StaleTransition` if the intent is not `Matched`.
    fn complete_payment_intent(
        &self,
        intent_id: &PaymentIntentId,
    ) -> Result<(PaymentIntent, LedgerAccount)>;

    /// Intents in `Pending` or `Matched`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_open_intents(&self) -> Result<Vec<PaymentIntent>>;

    // =========================================================================
    // Idempotency Guard
    // =========================================================================

    /// Atomically record `event` unless it is already present.
    ///
    /// Returns `true` if this call recorded it, `false` if it was a replay.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn record_event(&self, event: &EventKey) -> Result<bool>;

    /// Check whether `event` has been recorded.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn has_event(&self, event: &EventKey) -> Result<bool>;

    /// Get the record for `event`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_event(&self, event: &EventKey) -> Result<Option<ProcessedEventRecord>>;
}
