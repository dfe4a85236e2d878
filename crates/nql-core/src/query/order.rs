//! Sorting and pagination of result rows.

use std::cmp::Ordering;

use nql_proto::{get_path, Pagination, Row, RowSet, SortDirection, SortSpec};
use serde_json::Value;

use super::filter::compare_numbers;

/// Sort rows by the given keys, most significant first.
///
/// The sort is stable. Missing and `null` values sort first in ascending
/// order.
pub fn sort_rows(rows: &mut [Row], sort: &[SortSpec]) {
    if sort.is_empty() {
        return;
    }

    rows.sort_by(|a, b| {
        for spec in sort {
            let cmp = compare_values_opt(get_path(a, &spec.path), get_path(b, &spec.path));
            let cmp = match spec.direction {
                SortDirection::Asc => cmp,
                SortDirection::Desc => cmp.reverse(),
            };
            if cmp != Ordering::Equal {
                return cmp;
            }
        }
        Ordering::Equal
    });
}

/// Compare two optional values for sorting.
pub fn compare_values_opt(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(av), Some(bv)) => compare_values(av, bv),
    }
}

/// Total order over JSON values used for sorting.
///
/// Values of different types order as null < bool < number < string and
/// are otherwise equal.
fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            compare_numbers(x, y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) | Value::Object(_) => 4,
    }
}

/// Apply pagination to sorted rows.
///
/// The returned row set's `total` is the row count before pagination.
pub fn paginate(mut rows: Vec<Row>, pagination: Option<Pagination>) -> RowSet {
    let total = rows.len();
    let Some(pagination) = pagination else {
        return RowSet::new(rows, total);
    };

    if pagination.offset >= rows.len() {
        return RowSet::new(Vec::new(), total);
    }
    rows.drain(..pagination.offset);
    if let Some(limit) = pagination.limit() {
        rows.truncate(limit);
    }
    RowSet::new(rows, total)
}

/// Sort then paginate.
pub fn finish_rows(mut rows: Vec<Row>, sort: &[SortSpec], pagination: Option<Pagination>) -> RowSet {
    sort_rows(&mut rows, sort);
    paginate(rows, pagination)
}
