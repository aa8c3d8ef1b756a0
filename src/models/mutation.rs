use serde::Deserialize;

use super::ledger_entry::Reason;

/// Direction of a requested mutation
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Credit,
    Debit,
}

/// Mutation record from batch CSV input
#[derive(Debug, Clone, Deserialize)]
pub struct MutationRow {
    #[serde(rename = "op")]
    pub direction: Direction,
    pub user: String,
    pub amount: i64,
    #[serde(deserialize_with = "deserialize_reason")]
    pub reason: Reason,
    #[serde(default, rename = "ref", deserialize_with = "deserialize_optional_text")]
    pub external_ref: Option<String>,
}

fn deserialize_reason<'de, D>(deserializer: D) -> Result<Reason, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de;

    let s = String::deserialize(deserializer)?;
    s.parse::<Reason>().map_err(de::Error::custom)
}

/// Empty CSV cells become None
pub(crate) fn deserialize_optional_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: Option<String> = Option::deserialize(deserializer)?;
    Ok(s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()))
}

/// A requested balance change, before the engine applies a sign to it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    pub user_id: String,
    pub amount: i64,
    pub reason: Reason,
    pub external_ref: Option<String>,
    pub description: Option<String>,
}

impl Mutation {
    pub fn new(user_id: impl Into<String>, amount: i64, reason: Reason) -> Self {
        Self {
            user_id: user_id.into(),
            amount,
            reason,
            external_ref: None,
            description: None,
        }
    }

    /// Idempotency key; blank keys are treated as absent
    pub fn with_external_ref(mut self, external_ref: impl Into<String>) -> Self {
        let external_ref = external_ref.into();
        self.external_ref = Some(external_ref).filter(|r| !r.trim().is_empty());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

impl From<MutationRow> for Mutation {
    fn from(row: MutationRow) -> Self {
        Self {
            user_id: row.user,
            amount: row.amount,
            reason: row.reason,
            external_ref: row.external_ref,
            description: None,
        }
    }
}
