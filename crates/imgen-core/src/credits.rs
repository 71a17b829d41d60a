//! Credit transaction types for imgen.
//!
//! Every ledger operation writes one transaction record in the same batch as
//! the account change, so the history always explains the balance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::account::LedgerAccount;
use crate::{TransactionId, UserId};

/// A single ledger movement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditTransaction {
    /// Unique transaction ID (ULID for time-ordering).
    pub id: TransactionId,

    /// The user whose account was affected.
    pub user_id: UserId,

    /// What kind of movement this was.
    pub transaction_type: TransactionType,

    /// Magnitude of the movement in credits. Always positive.
    pub amount: i64,

    /// Available balance after this transaction.
    pub balance_after: i64,

    /// Held amount after this transaction.
    pub held_after: i64,

    /// The job or payment intent that caused the movement, if any.
    pub reference: Option<String>,

    /// Human-readable description.
    pub description: String,

    /// When the transaction was created.
    pub created_at: DateTime<Utc>,
}

impl CreditTransaction {
    /// Record a movement against the post-operation account state.
    #[must_use]
    pub fn record(
        account: &LedgerAccount,
        transaction_type: TransactionType,
        amount: i64,
        reference: Option<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: TransactionId::generate(),
            user_id: account.user_id,
            transaction_type,
            amount,
            balance_after: account.balance,
            held_after: account.held,
            reference,
            description: description.into(),
            created_at: Utc::now(),
        }
    }

    /// Signed change this transaction made to the available balance.
    #[must_use]
    pub const fn available_delta(&self) -> i64 {
        match self.transaction_type {
            TransactionType::Hold => -self.amount,
            TransactionType::Settle => 0,
            TransactionType::Release | TransactionType::Purchase | TransactionType::Grant => {
                self.amount
            }
        }
    }
}

/// Type of credit transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    /// Credits reserved for a submitted job.
    Hold,

    /// A hold returned after a failed or expired job.
    Release,

    /// A hold consumed by a successful job.
    Settle,

    /// Credits bought through a matched payment.
    Purchase,

    /// Credits granted by an administrator.
    Grant,
}

impl TransactionType {
    /// Name used in API responses and logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Hold => "hold",
            Self::Release => "release",
            Self::Settle => "settle",
            Self::Purchase => "purchase",
            Self::Grant => "grant",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_captures_post_state() {
        let mut account = LedgerAccount::new(UserId::generate());
        account.balance = 500;
        account.hold(200).unwrap();

        let tx = CreditTransaction::record(
            &account,
            TransactionType::Hold,
            200,
            Some("job-1".into()),
            "Hold for generation job",
        );

        assert_eq!(tx.balance_after, 300);
        assert_eq!(tx.held_after, 200);
        assert_eq!(tx.available_delta(), -200);
        assert_eq!(tx.reference.as_deref(), Some("job-1"));
    }

    #[test]
    fn settle_does_not_change_available() {
        let account = LedgerAccount::new(UserId::generate());
        let tx = CreditTransaction::record(&account, TransactionType::Settle, 10, None, "x");
        assert_eq!(tx.available_delta(), 0);
    }
}
