//! Protocol error types.

use thiserror::Error;

/// Errors raised while reading caller input into protocol types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// The query value is not a JSON object.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// A sort specifier could not be parsed.
    #[error("invalid sort specifier '{0}': expected 'path@asc' or 'path@desc'")]
    InvalidSort(String),

    /// Pagination parameters are out of range.
    #[error("invalid pagination: {0}")]
    InvalidPagination(String),
}
