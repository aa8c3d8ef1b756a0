use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Direction of a ledger entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryType {
    Credit,
    Debit,
}

/// Why the balance moved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Reason {
    Purchase,
    HomeworkReward,
    AdminAdjustment,
    Refund,
    Spend,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::Purchase => "PURCHASE",
            Reason::HomeworkReward => "HOMEWORK_REWARD",
            Reason::AdminAdjustment => "ADMIN_ADJUSTMENT",
            Reason::Refund => "REFUND",
            Reason::Spend => "SPEND",
        }
    }
}

impl std::str::FromStr for Reason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PURCHASE" => Ok(Reason::Purchase),
            "HOMEWORK_REWARD" => Ok(Reason::HomeworkReward),
            "ADMIN_ADJUSTMENT" => Ok(Reason::AdminAdjustment),
            "REFUND" => Ok(Reason::Refund),
            "SPEND" => Ok(Reason::Spend),
            other => Err(format!("unknown reason '{}'", other)),
        }
    }
}

/// Lifecycle of a ledger entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryStatus {
    Pending,
    Completed,
    Failed,
}

/// One immutable record of a single balance change
///
/// `resulting_balance` is the account balance produced by the same commit that
/// wrote this entry. A PENDING entry has not moved the balance yet, so its
/// snapshot is the balance at the time it was opened until it settles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: u64,
    pub user_id: String,
    pub amount: i64,
    pub resulting_balance: i64,
    #[serde(rename = "type")]
    pub entry_type: EntryType,
    pub reason: Reason,
    pub status: EntryStatus,
    pub external_ref: Option<String>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl LedgerEntry {
    pub fn is_completed(&self) -> bool {
        self.status == EntryStatus::Completed
    }

    /// Signed contribution of this entry to the account balance
    pub fn completed_amount(&self) -> i64 {
        if self.is_completed() {
            self.amount
        } else {
            0
        }
    }
}

/// Entry content handed to a unit of work
///
/// Id, timestamp and resulting balance are assigned by the store at commit
/// time so that they follow commit order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEntry {
    pub user_id: String,
    pub amount: i64,
    pub entry_type: EntryType,
    pub reason: Reason,
    pub status: EntryStatus,
    pub external_ref: Option<String>,
    pub description: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_parses_case_insensitively() {
        assert_eq!("spend".parse::<Reason>(), Ok(Reason::Spend));
        assert_eq!(
            " homework_reward ".parse::<Reason>(),
            Ok(Reason::HomeworkReward)
        );
        assert!("bonus".parse::<Reason>().is_err());
    }

    #[test]
    fn entry_serializes_with_wire_names() {
        let entry = LedgerEntry {
            id: 7,
            user_id: "user_1".to_string(),
            amount: -5,
            resulting_balance: 95,
            entry_type: EntryType::Debit,
            reason: Reason::Spend,
            status: EntryStatus::Completed,
            external_ref: None,
            description: None,
            created_at: Utc::now(),
            settled_at: None,
        };
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["type"], "DEBIT");
        assert_eq!(value["reason"], "SPEND");
        assert_eq!(value["status"], "COMPLETED");
    }
}
