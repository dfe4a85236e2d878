//! Query object types accepted from callers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Error;
use crate::value::ParamRow;

/// Candidate property-path suffixes for template references.
///
/// A template reference `prefix.$N` is resolved by replacing `$N` with the
/// `N`th entry of the template.
pub type Template = Vec<String>;

/// A declarative query object.
///
/// Each key encodes a field path plus operator and modifiers
/// (`"name ~contains"`, `"or size >"`, `"#and"`), and each value is a
/// literal, a parameter reference, a template reference or a nested query.
/// Key order is significant and preserved.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Query(Map<String, Value>);

impl Query {
    /// Create an empty query (matches everything).
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Append an entry to the query.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Read a query from a JSON value, which must be an object.
    pub fn from_value(value: Value) -> Result<Self, Error> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(Error::InvalidQuery(format!(
                "expected an object, got {}",
                json_kind(&other)
            ))),
        }
    }

    /// Iterate over entries in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Number of top-level entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if the query has no entries.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Borrow the underlying map.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Convert back into a JSON value.
    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }
}

impl TryFrom<Value> for Query {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::from_value(value)
    }
}

impl From<Map<String, Value>> for Query {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    /// Ascending order.
    Asc,
    /// Descending order.
    Desc,
}

/// One `path@direction` sort key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortSpec {
    /// Dot-delimited path to sort by.
    pub path: String,
    /// Sort direction.
    pub direction: SortDirection,
}

impl SortSpec {
    /// Create an ascending sort key.
    pub fn asc(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            direction: SortDirection::Asc,
        }
    }

    /// Create a descending sort key.
    pub fn desc(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            direction: SortDirection::Desc,
        }
    }

    /// Parse a `path@asc` / `path@desc` specifier. A bare path sorts ascending.
    pub fn parse(spec: &str) -> Result<Self, Error> {
        let (path, direction) = match spec.rsplit_once('@') {
            Some((path, "asc")) => (path, SortDirection::Asc),
            Some((path, "desc")) => (path, SortDirection::Desc),
            Some(_) => return Err(Error::InvalidSort(spec.to_string())),
            None => (spec, SortDirection::Asc),
        };
        if path.trim().is_empty() {
            return Err(Error::InvalidSort(spec.to_string()));
        }
        Ok(Self {
            path: path.trim().to_string(),
            direction,
        })
    }
}

impl FromStr for SortSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for SortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.direction {
            SortDirection::Asc => write!(f, "{}@asc", self.path),
            SortDirection::Desc => write!(f, "{}@desc", self.path),
        }
    }
}

/// Offset pagination.
///
/// `per_page == -1` returns every row, `per_page == 0` an empty page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    /// Rows per page, or `-1` for all rows.
    pub per_page: i64,
    /// Number of rows to skip.
    pub offset: usize,
}

impl Pagination {
    /// Create pagination with a page size and offset.
    pub fn new(per_page: i64, offset: usize) -> Self {
        Self { per_page, offset }
    }

    /// Pagination that returns every row.
    pub fn all() -> Self {
        Self {
            per_page: -1,
            offset: 0,
        }
    }

    /// Pagination for a 1-based page number.
    pub fn page(page: usize, per_page: i64) -> Self {
        let offset = if per_page > 0 {
            page.saturating_sub(1).saturating_mul(per_page as usize)
        } else {
            0
        };
        Self { per_page, offset }
    }

    /// Maximum number of rows, or `None` when unbounded.
    pub fn limit(&self) -> Option<usize> {
        if self.per_page < 0 {
            None
        } else {
            Some(self.per_page as usize)
        }
    }

    /// Reject page sizes below `-1`.
    pub fn validate(&self) -> Result<(), Error> {
        if self.per_page < -1 {
            return Err(Error::InvalidPagination(format!(
                "per_page must be -1 or greater, got {}",
                self.per_page
            )));
        }
        Ok(())
    }
}

/// A query addressed to a bucket, with everything needed to run it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Root bucket the query selects from.
    pub bucket: String,
    /// The query object.
    pub query: Query,
    /// Parameter rows for a batched evaluation (empty = unparameterized).
    #[serde(default)]
    pub params: Vec<ParamRow>,
    /// Candidate templates for `{'$': ..}` references, tried in order.
    #[serde(default)]
    pub templates: Vec<Template>,
    /// Sort keys, most significant first.
    #[serde(default)]
    pub sort: Vec<SortSpec>,
    /// Pagination for the final result.
    #[serde(default)]
    pub pagination: Option<Pagination>,
}

impl QueryRequest {
    /// Create a request for a bucket.
    pub fn new(bucket: impl Into<String>, query: Query) -> Self {
        Self {
            bucket: bucket.into(),
            query,
            params: vec![],
            templates: vec![],
            sort: vec![],
            pagination: None,
        }
    }

    /// Set all parameter rows.
    pub fn with_params(mut self, params: Vec<ParamRow>) -> Self {
        self.params = params;
        self
    }

    /// Add one parameter row.
    pub fn with_param(mut self, param: ParamRow) -> Self {
        self.params.push(param);
        self
    }

    /// Set the candidate templates.
    pub fn with_templates(mut self, templates: Vec<Template>) -> Self {
        self.templates = templates;
        self
    }

    /// Add a sort key.
    pub fn with_sort(mut self, sort: SortSpec) -> Self {
        self.sort.push(sort);
        self
    }

    /// Set pagination.
    pub fn with_pagination(mut self, pagination: Pagination) -> Self {
        self.pagination = Some(pagination);
        self
    }

    /// Check if the request carries parameter rows.
    pub fn is_parameterized(&self) -> bool {
        !self.params.is_empty()
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
