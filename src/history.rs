use serde::{Deserialize, Serialize};

use crate::models::LedgerEntry;
use crate::store::LedgerStore;

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 100;

/// Page request as it arrives from callers; anything out of range is clamped
///
/// Values that are not whole numbers count as absent.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct HistoryQuery {
    #[serde(default, deserialize_with = "lenient_number")]
    pub page: Option<i64>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub limit: Option<i64>,
}

impl HistoryQuery {
    pub fn new(page: i64, limit: i64) -> Self {
        Self {
            page: Some(page),
            limit: Some(limit),
        }
    }

    /// `(page, limit)` with `page >= 1` and `1 <= limit <= max_page_size`
    pub fn clamp(&self, max_page_size: u32) -> (u32, u32) {
        let max_page_size = max_page_size.max(1);
        let page = self.page.unwrap_or(1).clamp(1, i64::from(u32::MAX)) as u32;
        let limit = self
            .limit
            .unwrap_or(i64::from(DEFAULT_PAGE_SIZE))
            .clamp(1, i64::from(max_page_size)) as u32;
        (page, limit)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawNumber {
    Number(i64),
    Text(String),
    Other(serde::de::IgnoredAny),
}

/// Whole numbers given as numbers or text; anything else counts as absent
fn lenient_number<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Option<RawNumber> = Option::deserialize(deserializer)?;
    Ok(match raw {
        Some(RawNumber::Number(value)) => Some(value),
        Some(RawNumber::Text(text)) => text.trim().parse().ok(),
        Some(RawNumber::Other(_)) | None => None,
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPage {
    pub entries: Vec<LedgerEntry>,
    pub total: usize,
    pub page: u32,
    pub limit: u32,
    pub total_pages: usize,
}

/// Newest-first page of one user's ledger
pub fn history(
    store: &LedgerStore,
    user_id: &str,
    query: HistoryQuery,
    max_page_size: u32,
) -> HistoryPage {
    let (page, limit) = query.clamp(max_page_size);
    let total = store.count_by_user(user_id);
    let entries = store.list_by_user(user_id, page as usize, limit as usize);

    HistoryPage {
        entries,
        total,
        page,
        limit,
        total_pages: total.div_ceil(limit as usize),
    }
}
