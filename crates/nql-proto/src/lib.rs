//! NQL protocol types.
//!
//! This crate defines the caller-facing types of the NQL query engine: the
//! declarative [`Query`] object, the [`QueryRequest`] envelope carrying
//! parameters, templates, sorting and pagination, and the [`RowSet`] /
//! [`Page`] results returned by the engine.
//!
//! # Modules
//!
//! - [`value`] - Row aliases and deep-path helpers over JSON values
//! - [`query`] - Query objects, sort keys and pagination
//! - [`result`] - Row sets and pages
//! - [`error`] - Protocol error types
//!
//! # Example
//!
//! ```
//! use nql_proto::{Pagination, Query, QueryRequest, SortSpec};
//! use serde_json::json;
//!
//! let query = Query::from_value(json!({
//!     "size >": 11,
//!     "or name ~contains": "circle",
//! }))
//! .unwrap();
//!
//! let request = QueryRequest::new("shape", query)
//!     .with_sort(SortSpec::parse("size@desc").unwrap())
//!     .with_pagination(Pagination::new(10, 0));
//! assert_eq!(request.bucket, "shape");
//! ```

pub mod error;
pub mod query;
pub mod result;
pub mod value;

pub use error::Error;

pub use query::{Pagination, Query, QueryRequest, SortDirection, SortSpec, Template};
pub use result::{Page, RowSet};
pub use value::{distinct_values, get_path, identity_key, is_present, ParamRow, Row};
