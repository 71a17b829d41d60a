//! Ledger account for imgen.
//!
//! `balance` is what the user can spend right now. Placing a hold moves
//! credits out of `balance` into `held`; the hold is later either settled
//! (the credits are gone for good) or released (they return to `balance`).
//! Debiting at hold time is what keeps two concurrent jobs from spending the
//! same credits.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{BillingError, Result};
use crate::UserId;

/// A user's spendable credit balance plus outstanding reservations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerAccount {
    /// The owning user.
    pub user_id: UserId,

    /// Available credits. Never negative.
    pub balance: i64,

    /// Sum of holds placed for in-flight jobs.
    pub held: i64,

    /// Lifetime credits bought through payments.
    pub lifetime_purchased: i64,

    /// Lifetime credits granted manually.
    pub lifetime_granted: i64,

    /// Lifetime credits consumed by settled jobs.
    pub lifetime_used: i64,

    /// When the account was created.
    pub created_at: DateTime<Utc>,

    /// When the account was last updated.
    pub updated_at: DateTime<Utc>,
}

impl LedgerAccount {
    /// Create a new account with zero balance.
    #[must_use]
    pub fn new(user_id: UserId) -> Self {
        let now = Utc::now();
        Self {
            user_id,
            balance: 0,
            held: 0,
            lifetime_purchased: 0,
            lifetime_granted: 0,
            lifetime_used: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Check whether a hold of `amount` would succeed.
    #[must_use]
    pub fn can_hold(&self, amount: i64) -> bool {
        amount > 0 && self.balance >= amount
    }

    /// Reserve `amount` for an in-flight job.
    ///
    /// # Errors
    ///
    /// `InsufficientCredits` when the available balance is too low,
    /// `InvalidAmount` for non-positive amounts.
    pub fn hold(&mut self, amount: i64) -> Result<()> {
        ensure_positive(amount)?;
        if self.balance < amount {
            return Err(BillingError::InsufficientCredits {
                available: self.balance,
                required: amount,
            });
        }
        self.balance -= amount;
        self.held = checked_add(self.held, amount)?;
        self.touch();
        Ok(())
    }

    /// Return a previously placed hold to the available balance.
    ///
    /// # Errors
    ///
    /// `LedgerInvariant` if less than `amount` is currently held.
    pub fn release_hold(&mut self, amount: i64) -> Result<()> {
        ensure_positive(amount)?;
        self.take_from_held(amount)?;
        self.balance = checked_add(self.balance, amount)?;
        self.touch();
        Ok(())
    }

    /// Turn a hold into a permanent debit. The balance was already reduced
    /// when the hold was placed, so only `held` changes.
    ///
    /// # Errors
    ///
    /// `LedgerInvariant` if less than `amount` is currently held.
    pub fn settle_hold(&mut self, amount: i64) -> Result<()> {
        ensure_positive(amount)?;
        self.take_from_held(amount)?;
        self.lifetime_used = checked_add(self.lifetime_used, amount)?;
        self.touch();
        Ok(())
    }

    /// Add credits that arrived without a matching hold (payments, grants).
    ///
    /// # Errors
    ///
    /// `InvalidAmount` for non-positive amounts.
    pub fn credit(&mut self, amount: i64, source: CreditSource) -> Result<()> {
        ensure_positive(amount)?;
        self.balance = checked_add(self.balance, amount)?;
        match source {
            CreditSource::Payment => {
                self.lifetime_purchased = checked_add(self.lifetime_purchased, amount)?;
            }
            CreditSource::Grant => {
                self.lifetime_granted = checked_add(self.lifetime_granted, amount)?;
            }
        }
        self.touch();
        Ok(())
    }

    /// Available plus held: everything the user still owns.
    #[must_use]
    pub fn total(&self) -> i64 {
        self.balance + self.held
    }

    fn take_from_held(&mut self, amount: i64) -> Result<()> {
        if self.held < amount {
            return Err(BillingError::LedgerInvariant(format!(
                "cannot take {amount} from held amount {}",
                self.held
            )));
        }
        self.held -= amount;
        Ok(())
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Where credits added through [`LedgerAccount::credit`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditSource {
    /// A matched bank transfer.
    Payment,
    /// An administrative grant.
    Grant,
}

fn ensure_positive(amount: i64) -> Result<()> {
    if amount <= 0 {
        return Err(BillingError::InvalidAmount(amount));
    }
    Ok(())
}

fn checked_add(a: i64, b: i64) -> Result<i64> {
    a.checked_add(b)
        .ok_or_else(|| BillingError::LedgerInvariant(format!("overflow adding {b} to {a}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn funded(balance: i64) -> LedgerAccount {
        let mut account = LedgerAccount::new(UserId::generate());
        account.balance = balance;
        account
    }

    #[test]
    fn new_account_is_empty() {
        let account = LedgerAccount::new(UserId::generate());
        assert_eq!(account.balance, 0);
        assert_eq!(account.held, 0);
        assert_eq!(account.total(), 0);
    }

    #[test]
    fn hold_moves_balance_into_held() {
        let mut account = funded(100);
        account.hold(100).unwrap();
        assert_eq!(account.balance, 0);
        assert_eq!(account.held, 100);
        assert_eq!(account.total(), 100);
    }

    #[test]
    fn hold_beyond_balance_fails_without_mutation() {
        let mut account = funded(50);
        let before = account.clone();
        let err = account.hold(51).unwrap_err();
        assert_eq!(
            err,
            BillingError::InsufficientCredits {
                available: 50,
                required: 51
            }
        );
        assert_eq!(account, before);
    }

    #[test]
    fn release_restores_balance_exactly() {
        let mut account = funded(300);
        account.hold(120).unwrap();
        account.release_hold(120).unwrap();
        assert_eq!(account.balance, 300);
        assert_eq!(account.held, 0);
    }

    #[test]
    fn settle_only_clears_held() {
        let mut account = funded(300);
        account.hold(120).unwrap();
        account.settle_hold(120).unwrap();
        assert_eq!(account.balance, 180);
        assert_eq!(account.held, 0);
        assert_eq!(account.lifetime_used, 120);
    }

    #[test]
    fn releasing_more_than_held_is_an_invariant_violation() {
        let mut account = funded(300);
        account.hold(10).unwrap();
        assert!(matches!(
            account.release_hold(11),
            Err(BillingError::LedgerInvariant(_))
        ));
        assert!(matches!(
            account.settle_hold(11),
            Err(BillingError::LedgerInvariant(_))
        ));
        assert_eq!(account.held, 10);
        assert_eq!(account.balance, 290);
    }

    #[test]
    fn non_positive_amounts_are_rejected() {
        let mut account = funded(10);
        assert_eq!(account.hold(0), Err(BillingError::InvalidAmount(0)));
        assert_eq!(
            account.credit(-5, CreditSource::Payment),
            Err(BillingError::InvalidAmount(-5))
        );
    }

    #[test]
    fn credit_tracks_lifetime_by_source() {
        let mut account = funded(0);
        account.credit(50_000, CreditSource::Payment).unwrap();
        account.credit(500, CreditSource::Grant).unwrap();
        assert_eq!(account.balance, 50_500);
        assert_eq!(account.lifetime_purchased, 50_000);
        assert_eq!(account.lifetime_granted, 500);
    }
}
