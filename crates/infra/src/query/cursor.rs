//! Opaque cursor tokens and pages.
//!
//! Listings are ordered `created_at DESC, sort_id DESC`. A token encodes the
//! boundary sort key plus the direction to move from it, as URL-safe base64
//! JSON.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::StorageError;

use super::filter::Filter;

pub const DEFAULT_PAGE_SIZE: usize = 15;
pub const MAX_PAGE_SIZE: usize = 1000;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Older items (further down the DESC ordering).
    Next,
    /// Newer items.
    Previous,
}

/// Sort key of one listed row.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SortKey {
    pub created_at: DateTime<Utc>,
    pub sort_id: i64,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    #[serde(flatten)]
    pub boundary: SortKey,
    pub direction: Direction,
    pub page_size: usize,
}

impl Cursor {
    pub fn encode(&self) -> String {
        // Only timestamps, integers and a fixed enum: serialization cannot fail.
        let json = serde_json::to_vec(self).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(json)
    }

    pub fn decode(token: &str) -> Result<Self, StorageError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|_| StorageError::validation("malformed cursor"))?;
        serde_json::from_slice(&bytes).map_err(|_| StorageError::validation("malformed cursor"))
    }

    /// Whether a row with `key` lies beyond this cursor's boundary.
    pub fn admits(&self, key: &SortKey) -> bool {
        match self.direction {
            Direction::Next => key < &self.boundary,
            Direction::Previous => key > &self.boundary,
        }
    }
}

/// A listing request.
#[derive(Debug, Clone, PartialEq)]
pub struct ListQuery {
    pub filter: Option<Filter>,
    pub page_size: usize,
    /// Token from a previous page's `next` or `previous`.
    pub cursor: Option<String>,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            filter: None,
            page_size: DEFAULT_PAGE_SIZE,
            cursor: None,
        }
    }
}

impl ListQuery {
    pub fn with_filter(filter: Filter) -> Self {
        Self {
            filter: Some(filter),
            ..Self::default()
        }
    }

    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn after(mut self, cursor: impl Into<String>) -> Self {
        self.cursor = Some(cursor.into());
        self
    }

    /// Resolve the cursor (if any) and the effective page size.
    ///
    /// A cursor carries the page size it was issued with, which overrides
    /// `page_size`. It does not carry the filter: callers send the same
    /// filter with every page.
    pub fn resolve(&self) -> Result<(Option<Cursor>, usize), StorageError> {
        let cursor = self.cursor.as_deref().map(Cursor::decode).transpose()?;
        let page_size = cursor.map(|c| c.page_size).unwrap_or(self.page_size);
        if page_size == 0 || page_size > MAX_PAGE_SIZE {
            return Err(StorageError::validation(format!(
                "page size must be between 1 and {MAX_PAGE_SIZE}"
            )));
        }
        Ok((cursor, page_size))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub page_size: usize,
    /// More rows exist in the direction that was requested.
    pub has_more: bool,
    pub next: Option<String>,
    pub previous: Option<String>,
}

/// Assemble a page from rows fetched with a limit of `page_size + 1`.
///
/// Rows must be in fetch order: DESC when moving forward (no cursor or
/// `Next`), ASC when moving backward.
pub fn build_page<T>(
    mut rows: Vec<(SortKey, T)>,
    cursor: Option<&Cursor>,
    page_size: usize,
) -> Page<T> {
    let extra = rows.len() > page_size;
    rows.truncate(page_size);

    let backward = matches!(cursor.map(|c| c.direction), Some(Direction::Previous));
    if backward {
        rows.reverse();
    }

    let token = |key: SortKey, direction: Direction| {
        Cursor {
            boundary: key,
            direction,
            page_size,
        }
        .encode()
    };
    let first = rows.first().map(|(k, _)| *k);
    let last = rows.last().map(|(k, _)| *k);

    let (next, previous) = if backward {
        (
            last.map(|k| token(k, Direction::Next)),
            first.filter(|_| extra).map(|k| token(k, Direction::Previous)),
        )
    } else {
        (
            last.filter(|_| extra).map(|k| token(k, Direction::Next)),
            first
                .filter(|_| cursor.is_some())
                .map(|k| token(k, Direction::Previous)),
        )
    };

    Page {
        data: rows.into_iter().map(|(_, item)| item).collect(),
        page_size,
        has_more: extra,
        next,
        previous,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn key(offset: i64) -> SortKey {
        SortKey {
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(offset),
            sort_id: offset,
        }
    }

    /// Simulates a backend over rows 0..10 (newest = 9).
    fn fetch(cursor: Option<&Cursor>, page_size: usize) -> Vec<(SortKey, i64)> {
        let mut rows: Vec<_> = (0..10)
            .map(|i| (key(i), i))
            .filter(|(k, _)| cursor.is_none_or(|c| c.admits(k)))
            .collect();
        if matches!(cursor.map(|c| c.direction), Some(Direction::Previous)) {
            rows.sort_by_key(|(k, _)| *k);
        } else {
            rows.sort_by_key(|(k, _)| std::cmp::Reverse(*k));
        }
        rows.truncate(page_size + 1);
        rows
    }

    #[test]
    fn pages_forward_and_back() {
        let first = build_page(fetch(None, 4), None, 4);
        assert_eq!(first.data, vec![9, 8, 7, 6]);
        assert!(first.previous.is_none());

        let next = Cursor::decode(first.next.as_deref().unwrap()).unwrap();
        let second = build_page(fetch(Some(&next), 4), Some(&next), 4);
        assert_eq!(second.data, vec![5, 4, 3, 2]);

        let next = Cursor::decode(second.next.as_deref().unwrap()).unwrap();
        let third = build_page(fetch(Some(&next), 4), Some(&next), 4);
        assert_eq!(third.data, vec![1, 0]);
        assert!(third.next.is_none());
        assert!(!third.has_more);

        let prev = Cursor::decode(third.previous.as_deref().unwrap()).unwrap();
        let back = build_page(fetch(Some(&prev), 4), Some(&prev), 4);
        assert_eq!(back.data, vec![5, 4, 3, 2]);
        assert!(back.previous.is_some());

        let prev = Cursor::decode(back.previous.as_deref().unwrap()).unwrap();
        let top = build_page(fetch(Some(&prev), 4), Some(&prev), 4);
        assert_eq!(top.data, vec![9, 8, 7, 6]);
        assert!(top.previous.is_none());
        assert!(top.next.is_some());
    }

    #[test]
    fn garbage_tokens_are_rejected() {
        assert!(matches!(Cursor::decode("%%%"), Err(StorageError::Validation(_))));
        assert!(matches!(
            ListQuery::default().after(URL_SAFE_NO_PAD.encode(b"{}")).resolve(),
            Err(StorageError::Validation(_))
        ));
    }

    #[test]
    fn page_size_is_bounded() {
        assert!(ListQuery::default().page_size(0).resolve().is_err());
        assert!(ListQuery::default().page_size(MAX_PAGE_SIZE + 1).resolve().is_err());
        assert_eq!(ListQuery::default().resolve().unwrap(), (None, DEFAULT_PAGE_SIZE));
    }
}
