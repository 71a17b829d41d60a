//! Key encoding utilities for `RocksDB`.
//!
//! Record keys and the lock-table keys that serialize writers on the same
//! record both live here, so the two can never drift apart.

use imgen_core::{EventKey, JobId, PaymentIntentId, TransactionId, UserId};

use crate::error::{Result, StoreError};

/// Create an account key from a user ID.
#[must_use]
pub fn account_key(user_id: &UserId) -> Vec<u8> {
    user_id.as_bytes().to_vec()
}

/// Create a transaction key from a transaction ID.
#[must_use]
pub fn transaction_key(transaction_id: &TransactionId) -> Vec<u8> {
    transaction_id.to_bytes().to_vec()
}

/// Create a user-transaction index key.
///
/// Format: `user_id (16 bytes) || transaction_id (16 bytes)`
///
/// Since ULIDs are time-ordered, transactions for a user will be sorted by time.
#[must_use]
pub fn user_transaction_key(user_id: &UserId, transaction_id: &TransactionId) -> Vec<u8> {
    let mut key = Vec::with_capacity(32);
    key.extend_from_slice(user_id.as_bytes());
    key.extend_from_slice(&transaction_id.to_bytes());
    key
}

/// Create a prefix for iterating all transactions for a user.
#[must_use]
pub fn user_transactions_prefix(user_id: &UserId) -> Vec<u8> {
    user_id.as_bytes().to_vec()
}

/// Extract the transaction ID from a user-transaction index key.
///
/// # Errors
///
/// `Serialization` if the key is not 32 bytes long.
pub fn extract_transaction_id_from_user_key(key: &[u8]) -> Result<TransactionId> {
    key.get(16..32)
        .and_then(|tail| <[u8; 16]>::try_from(tail).ok())
        .map(TransactionId::from_bytes)
        .ok_or_else(|| StoreError::Serialization(format!("bad user index key length {}", key.len())))
}

/// Create a job key from a job ID.
#[must_use]
pub fn job_key(job_id: &JobId) -> Vec<u8> {
    job_id.to_bytes().to_vec()
}

/// Rebuild a job ID from a job key or a `jobs_by_task` value.
///
/// # Errors
///
/// `Serialization` if the bytes are not a 16-byte ULID.
pub fn job_id_from_bytes(bytes: &[u8]) -> Result<JobId> {
    <[u8; 16]>::try_from(bytes)
        .map(JobId::from_bytes)
        .map_err(|_| StoreError::Serialization(format!("bad job key length {}", bytes.len())))
}

/// Create a provider-task index key.
///
/// Format: `provider || 0x00 || task_id`. Task ids are only unique per
/// provider.
#[must_use]
pub fn task_key(provider: &str, task_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(provider.len() + 1 + task_id.len());
    key.extend_from_slice(provider.as_bytes());
    key.push(0);
    key.extend_from_slice(task_id.as_bytes());
    key
}

/// Create a payment intent key from an intent ID.
#[must_use]
pub fn intent_key(intent_id: &PaymentIntentId) -> Vec<u8> {
    intent_id.to_bytes().to_vec()
}

/// Rebuild an intent ID from an intent key or a token index value.
///
/// # Errors
///
/// `Serialization` if the bytes are not a 16-byte ULID.
pub fn intent_id_from_bytes(bytes: &[u8]) -> Result<PaymentIntentId> {
    <[u8; 16]>::try_from(bytes)
        .map(PaymentIntentId::from_bytes)
        .map_err(|_| StoreError::Serialization(format!("bad intent key length {}", bytes.len())))
}

/// Create a match-token index key. Tokens are stored normalized.
#[must_use]
pub fn token_key(match_token: &str) -> Vec<u8> {
    match_token.as_bytes().to_vec()
}

/// Create a processed-event key.
#[must_use]
pub fn event_key(event: &EventKey) -> Vec<u8> {
    event.to_storage_key()
}

/// Lock-table keys. Each is namespaced so different record kinds never
/// collide.
pub mod lock {
    use super::{EventKey, JobId, PaymentIntentId, UserId};

    /// Serializes every ledger mutation on one account.
    #[must_use]
    pub fn account(user_id: &UserId) -> Vec<u8> {
        namespaced(b"acct:", user_id.as_bytes())
    }

    /// Serializes state transitions of one job.
    #[must_use]
    pub fn job(job_id: &JobId) -> Vec<u8> {
        namespaced(b"job:", &job_id.to_bytes())
    }

    /// Serializes state transitions of one payment intent.
    #[must_use]
    pub fn intent(intent_id: &PaymentIntentId) -> Vec<u8> {
        namespaced(b"intent:", &intent_id.to_bytes())
    }

    /// Serializes intent creation per match token.
    #[must_use]
    pub fn token(match_token: &str) -> Vec<u8> {
        namespaced(b"token:", match_token.as_bytes())
    }

    /// Makes the processed-event check-and-insert atomic.
    #[must_use]
    pub fn event(event: &EventKey) -> Vec<u8> {
        namespaced(b"event:", &event.to_storage_key())
    }

    fn namespaced(prefix: &[u8], id: &[u8]) -> Vec<u8> {
        let mut key = Vec::with_capacity(prefix.len() + id.len());
        key.extend_from_slice(prefix);
        key.extend_from_slice(id);
        key
    }
}
