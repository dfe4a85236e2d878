//! Runtime value helpers.
//!
//! Rows, parameter rows and query values are all plain JSON values. This
//! module provides the deep-path access and emptiness rules shared by the
//! engine and every runner.

use std::collections::HashSet;

use serde_json::Value;

/// A single object returned by a runner.
pub type Row = Value;

/// One row of correlated parameter values for a batched query.
pub type ParamRow = Value;

/// Read a dot-delimited path from a value.
///
/// Object segments are looked up by key; array segments must be a
/// numeric index. Returns `None` as soon as a segment cannot be followed.
pub fn get_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Check whether a (possibly missing) value counts as present.
///
/// `null`, missing, `""`, `[]` and `{}` are all empty.
pub fn is_present(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(items)) => !items.is_empty(),
        Some(Value::Object(map)) => !map.is_empty(),
        Some(_) => true,
    }
}

/// Key used to index an object by its identity value.
///
/// Strings are used as-is and numbers by their decimal text; any other
/// identity value is rejected.
pub fn identity_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Distinct non-null values at `path` across rows, in first-seen order.
pub fn distinct_values(rows: &[Row], path: &str) -> Vec<Value> {
    let mut seen = HashSet::new();
    rows.iter()
        .filter_map(|row| get_path(row, path))
        .filter(|value| !value.is_null())
        .filter(|value| seen.insert(value.to_string()))
        .cloned()
        .collect()
}
