//! Account types for z-metering.
//!
//! An account holds a user's spendable credit balance. The balance is only
//! ever changed together with a ledger [`Transaction`](crate::Transaction)
//! in the same atomic write, so it always equals the sum of that user's
//! transaction amounts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::UserId;

/// A credit account for a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    /// The user ID (from the identity system).
    pub user_id: UserId,

    /// Current balance in credit minor units. Never negative.
    pub balance: i64,

    /// Incremented on every balance change.
    pub version: u64,

    /// When the account was created.
    pub created_at: DateTime<Utc>,

    /// When the account was last updated.
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// Create a new account with zero balance.
    #[must_use]
    pub fn new(user_id: UserId) -> Self {
        let now = Utc::now();
        Self {
            user_id,
            balance: 0,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Check if the account can cover a debit of `amount`.
    #[must_use]
    pub fn has_sufficient_credits(&self, amount: i64) -> bool {
        self.balance >= amount
    }

    /// Apply a signed delta and bump the version.
    ///
    /// Returns the balance before the change, or `None` (leaving the account
    /// untouched) if the new balance would overflow. Callers are responsible
    /// for rejecting deltas that would drive the balance negative.
    pub fn apply_delta(&mut self, delta: i64) -> Option<i64> {
        let previous = self.balance;
        self.balance = previous.checked_add(delta)?;
        self.version += 1;
        self.updated_at = Utc::now();
        Some(previous)
    }
}
