//! Result types for query responses.

use serde::{Deserialize, Serialize};

use crate::query::Pagination;
use crate::value::{distinct_values, get_path, Row};

/// Rows matched for one parameter row (or for an unparameterized query).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowSet {
    /// Matching rows after sorting and pagination.
    pub rows: Vec<Row>,
    /// Number of matching rows before pagination.
    pub total: usize,
}

impl RowSet {
    /// Create a row set with an explicit pre-pagination total.
    pub fn new(rows: Vec<Row>, total: usize) -> Self {
        Self { rows, total }
    }

    /// Create an unpaginated row set.
    pub fn from_rows(rows: Vec<Row>) -> Self {
        let total = rows.len();
        Self { rows, total }
    }

    /// An empty row set.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Number of rows returned.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Check if no rows were returned.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Collect the values at `path` across all rows, skipping missing ones.
    pub fn column(&self, path: &str) -> Vec<&serde_json::Value> {
        self.rows.iter().filter_map(|row| get_path(row, path)).collect()
    }

    /// Distinct non-null values at `path`, in first-seen order.
    pub fn distinct(&self, path: &str) -> Vec<serde_json::Value> {
        distinct_values(&self.rows, path)
    }
}

/// A page of results with pagination metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    /// Rows on this page.
    pub data: Vec<Row>,
    /// Number of matching rows across all pages.
    pub total: usize,
    /// Offset of the first row on this page.
    pub offset: usize,
    /// Requested page size (`-1` = all rows).
    pub per_page: i64,
    /// Whether rows exist after this page.
    pub has_more: bool,
}

impl Page {
    /// Build a page from a paginated row set.
    pub fn from_row_set(set: RowSet, pagination: Pagination) -> Self {
        let has_more = pagination.offset + set.rows.len() < set.total;
        Self {
            data: set.rows,
            total: set.total,
            offset: pagination.offset,
            per_page: pagination.per_page,
            has_more,
        }
    }
}
