//! Database schema definitions and column families.
//!
//! This module defines the column families used in `RocksDB` storage.

/// Column family names for the `RocksDB` database.
pub mod cf {
    /// Ledger accounts, keyed by `user_id`.
    pub const ACCOUNTS: &str = "accounts";

    /// Credit transactions, keyed by `transaction_id` (ULID).
    pub const TRANSACTIONS: &str = "transactions";

    /// Index: transactions by user, keyed by `user_id || transaction_id`.
    /// Value is empty (index only).
    pub const TRANSACTIONS_BY_USER: &str = "transactions_by_user";

    /// Generation jobs, keyed by `job_id` (ULID).
    pub const JOBS: &str = "jobs";

    /// Index: `provider || 0x00 || provider_task_id` to `job_id`.
    pub const JOBS_BY_TASK: &str = "jobs_by_task";

    /// Index: jobs not yet in a terminal state, keyed by `job_id`.
    /// Value is empty (index only).
    pub const LIVE_JOBS: &str = "live_jobs";

    /// Payment intents, keyed by `intent_id` (ULID).
    pub const PAYMENT_INTENTS: &str = "payment_intents";

    /// Index: normalized match token to `intent_id`.
    pub const INTENTS_BY_TOKEN: &str = "intents_by_token";

    /// Index: intents in `Pending` or `Matched`, keyed by `intent_id`.
    /// Value is empty (index only).
    pub const OPEN_INTENTS: &str = "open_intents";

    /// Processed external events, keyed by `source/external_id`.
    pub const PROCESSED_EVENTS: &str = "processed_events";
}

/// Returns all column family names for database initialization.
#[must_use]
pub fn all_column_families() -> Vec<&'static str> {
    vec![
        cf::ACCOUNTS,
        cf::TRANSACTIONS,
        cf::TRANSACTIONS_BY_USER,
        cf::JOBS,
        cf::JOBS_BY_TASK,
        cf::LIVE_JOBS,
        cf::PAYMENT_INTENTS,
        cf::INTENTS_BY_TOKEN,
        cf::OPEN_INTENTS,
        cf::PROCESSED_EVENTS,
    ]
}
