use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Account state
///
/// The balance is only ever changed by the mutation engine through a committed
/// unit of work; nothing outside the crate can set it directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub user_id: String,
    pub balance: i64,
    pub archived: bool,
    pub created_at: DateTime<Utc>,
}

impl Account {
    /// Create a new account with a zero balance
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            balance: 0,
            archived: false,
            created_at: Utc::now(),
        }
    }

    /// Balance after crediting `amount`
    /// Returns None on overflow
    pub fn balance_after_credit(&self, amount: i64) -> Option<i64> {
        self.balance.checked_add(amount)
    }

    /// Balance after debiting `amount`
    /// Returns None if the result would be negative
    pub fn balance_after_debit(&self, amount: i64) -> Option<i64> {
        self.balance.checked_sub(amount).filter(|balance| *balance >= 0)
    }
}
