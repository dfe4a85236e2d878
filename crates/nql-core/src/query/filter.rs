//! Rule evaluation against JSON rows.
//!
//! This module provides the `FilterEvaluator` that evaluates resolved rule
//! trees against rows. Rules must carry static values or resolved value
//! sets; parameter, template, sub-query and part references have to be
//! bound before evaluation.

use std::cmp::Ordering;

use nql_proto::{get_path, is_present};
use serde_json::{Number, Value};
use thiserror::Error;

use super::ast::{Intersection, Member, Op, Rule, RuleValue, Union};

/// A rule reached evaluation with a reference that was never bound.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("rule on '{fieldpath}' has an unbound {kind} value")]
pub struct UnboundRule {
    /// Field path of the rule.
    pub fieldpath: String,
    /// Kind of reference left unbound.
    pub kind: &'static str,
}

/// Evaluates rule trees against rows.
pub struct FilterEvaluator;

impl FilterEvaluator {
    /// Evaluate a union against a row. An empty union matches every row.
    pub fn evaluate(union: &Union, row: &Value) -> Result<bool, UnboundRule> {
        if union.intersections.is_empty() {
            return Ok(true);
        }
        for intersection in &union.intersections {
            if Self::evaluate_intersection(intersection, row)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn evaluate_intersection(intersection: &Intersection, row: &Value) -> Result<bool, UnboundRule> {
        for member in &intersection.members {
            let matched = match member {
                Member::Rule(rule) => Self::evaluate_rule(rule, row)?,
                Member::Union(union) => Self::evaluate(union, row)?,
            };
            if !matched {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Evaluate a single rule against a row.
    pub fn evaluate_rule(rule: &Rule, row: &Value) -> Result<bool, UnboundRule> {
        let field = get_path(row, &rule.fieldpath);
        let ci = rule.case_insensitive;

        let matched = match &rule.value {
            RuleValue::Static(value) => Self::test_static(rule.op, ci, field, value),
            RuleValue::Values(values) => Self::test_set(rule.op, ci, field, values),
            RuleValue::Param(_) => return Err(Self::unbound(rule, "parameter")),
            RuleValue::Template(_) => return Err(Self::unbound(rule, "template")),
            RuleValue::SubQuery(_) => return Err(Self::unbound(rule, "sub-query")),
            RuleValue::Part(_) => return Err(Self::unbound(rule, "part")),
        };

        Ok(matched != rule.not)
    }

    fn unbound(rule: &Rule, kind: &'static str) -> UnboundRule {
        UnboundRule {
            fieldpath: rule.fieldpath.clone(),
            kind,
        }
    }

    fn test_static(op: Op, ci: bool, field: Option<&Value>, value: &Value) -> bool {
        let field_value = field.unwrap_or(&Value::Null);
        match op {
            Op::Present => is_present(field),
            Op::Eq => Self::values_equal(field_value, value, ci),
            Op::In => match value {
                Value::Array(items) => items.iter().any(|v| Self::values_equal(field_value, v, ci)),
                other => Self::values_equal(field_value, other, ci),
            },
            Op::Contains => Self::contains(field_value, value, ci),
            Op::ContainsAny => match value {
                Value::Array(items) => items.iter().any(|v| Self::contains(field_value, v, ci)),
                other => Self::contains(field_value, other, ci),
            },
            Op::Gt | Op::Lt | Op::Gte | Op::Lte => match field {
                Some(fv) => Self::ordering_matches(op, fv, value),
                None => false,
            },
        }
    }

    /// Test against a resolved value set. The rule holds if any value in the
    /// set satisfies it; an empty set never does.
    fn test_set(op: Op, ci: bool, field: Option<&Value>, values: &[Value]) -> bool {
        let field_value = field.unwrap_or(&Value::Null);
        match op {
            Op::Present => is_present(field),
            Op::Eq | Op::In => values.iter().any(|v| Self::values_equal(field_value, v, ci)),
            Op::Contains | Op::ContainsAny => {
                values.iter().any(|v| Self::contains(field_value, v, ci))
            }
            Op::Gt | Op::Lt | Op::Gte | Op::Lte => match field {
                Some(fv) => values.iter().any(|v| Self::ordering_matches(op, fv, v)),
                None => false,
            },
        }
    }

    fn ordering_matches(op: Op, field: &Value, value: &Value) -> bool {
        match Self::compare_values(field, value) {
            Some(ord) => match op {
                Op::Gt => ord.is_gt(),
                Op::Lt => ord.is_lt(),
                Op::Gte => ord.is_ge(),
                Op::Lte => ord.is_le(),
                _ => false,
            },
            None => false,
        }
    }

    /// Check if two values are equal.
    ///
    /// Numbers compare by value regardless of representation, strings
    /// optionally ignoring case.
    pub fn values_equal(a: &Value, b: &Value, case_insensitive: bool) -> bool {
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => {
                compare_numbers(x, y) == Some(Ordering::Equal)
            }
            (Value::String(x), Value::String(y)) if case_insensitive => {
                x.to_lowercase() == y.to_lowercase()
            }
            _ => a == b,
        }
    }

    /// Compare two values for ordering.
    ///
    /// Returns `None` if the values are not comparable.
    pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => compare_numbers(x, y),
            (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
            (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
            _ => None,
        }
    }

    fn contains(field: &Value, needle: &Value, case_insensitive: bool) -> bool {
        match (field, needle) {
            (Value::String(haystack), Value::String(needle)) => {
                if case_insensitive {
                    haystack.to_lowercase().contains(&needle.to_lowercase())
                } else {
                    haystack.contains(needle.as_str())
                }
            }
            (Value::Array(items), needle) => {
                items.iter().any(|item| Self::values_equal(item, needle, case_insensitive))
            }
            _ => false,
        }
    }
}

/// Compare two JSON numbers.
///
/// Integers compare exactly; `f64` is used only when either side is a float.
pub(crate) fn compare_numbers(x: &Number, y: &Number) -> Option<Ordering> {
    if x.is_f64() || y.is_f64() {
        return x.as_f64()?.partial_cmp(&y.as_f64()?);
    }
    if let (Some(a), Some(b)) = (x.as_i64(), y.as_i64()) {
        return Some(a.cmp(&b));
    }
    if let (Some(a), Some(b)) = (x.as_u64(), y.as_u64()) {
        return Some(a.cmp(&b));
    }
    // one side is negative, the other above i64::MAX
    Some(if x.as_i64().is_some() {
        Ordering::Less
    } else {
        Ordering::Greater
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::ast::{ParamRef, Rule};
    use serde_json::json;

    fn rule(fieldpath: &str, op: Op, value: Value) -> Rule {
        Rule::new(fieldpath, op, RuleValue::Static(value))
    }

    fn eval(rule: &Rule, row: &Value) -> bool {
        FilterEvaluator::evaluate_rule(rule, row).unwrap()
    }

    #[test]
    fn test_equality() {
        let row = json!({"id": 1, "name": "Shape 1", "meta": {"hex": "#FF0000"}});

        assert!(eval(&rule("id", Op::Eq, json!(1)), &row));
        assert!(eval(&rule("id", Op::Eq, json!(1.0)), &row));
        assert!(!eval(&rule("name", Op::Eq, json!("shape 1")), &row));
        assert!(eval(&rule("name", Op::Eq, json!("shape 1")).case_insensitive(), &row));
        assert!(eval(&rule("meta.hex", Op::Eq, json!("#FF0000")), &row));
        assert!(eval(&rule("missing", Op::Eq, Value::Null), &row));
        assert!(eval(&rule("id", Op::Eq, json!(2)).negated(), &row));
    }

    #[test]
    fn test_ordering() {
        let row = json!({"size": 22, "name": "b"});

        assert!(eval(&rule("size", Op::Gt, json!(11)), &row));
        assert!(eval(&rule("size", Op::Gte, json!(22)), &row));
        assert!(!eval(&rule("size", Op::Lt, json!(22)), &row));
        assert!(eval(&rule("size", Op::Lte, json!(22.5)), &row));
        assert!(eval(&rule("name", Op::Lt, json!("c")), &row));
        assert!(!eval(&rule("size", Op::Gt, json!("11")), &row));
        assert!(!eval(&rule("missing", Op::Gt, json!(0)), &row));
        assert!(eval(&rule("missing", Op::Gt, json!(0)).negated(), &row));
    }

    #[test]
    fn test_in_and_contains() {
        let row = json!({"name": "Shape Red", "tags": ["a", "b"], "size": 11});

        assert!(eval(&rule("size", Op::In, json!([11, 22])), &row));
        assert!(!eval(&rule("size", Op::In, json!([])), &row));
        assert!(eval(&rule("name", Op::In, json!(["shape red"])).case_insensitive(), &row));
        assert!(eval(&rule("name", Op::Contains, json!("Red")), &row));
        assert!(!eval(&rule("name", Op::Contains, json!("red")), &row));
        assert!(eval(&rule("name", Op::Contains, json!("red")).case_insensitive(), &row));
        assert!(eval(&rule("tags", Op::Contains, json!("b")), &row));
        assert!(eval(&rule("name", Op::ContainsAny, json!(["Blue", "Red"])), &row));
        assert!(!eval(&rule("name", Op::ContainsAny, json!(["Blue"])), &row));
        assert!(!eval(&rule("size", Op::Contains, json!("1")), &row));
    }

    #[test]
    fn test_present() {
        let row = json!({"a": 0, "b": "", "c": [], "d": {}, "e": null, "f": "x", "g": false});

        assert!(eval(&rule("a", Op::Present, Value::Null), &row));
        assert!(!eval(&rule("b", Op::Present, Value::Null), &row));
        assert!(!eval(&rule("c", Op::Present, Value::Null), &row));
        assert!(!eval(&rule("d", Op::Present, Value::Null), &row));
        assert!(!eval(&rule("e", Op::Present, Value::Null), &row));
        assert!(eval(&rule("f", Op::Present, Value::Null), &row));
        assert!(eval(&rule("g", Op::Present, Value::Null), &row));
        assert!(!eval(&rule("zz", Op::Present, Value::Null), &row));
        assert!(eval(&rule("zz", Op::Present, Value::Null).negated(), &row));
    }

    #[test]
    fn test_value_sets() {
        let row = json!({"color_id": 2, "name": "Shape Green", "size": 22});
        let set = |fieldpath: &str, op: Op, values: Vec<Value>| {
            Rule::new(fieldpath, op, RuleValue::Values(values))
        };

        assert!(eval(&set("color_id", Op::Eq, vec![json!(1), json!(2)]), &row));
        assert!(eval(&set("color_id", Op::In, vec![json!(2)]), &row));
        assert!(!eval(&set("color_id", Op::Eq, vec![]), &row));
        assert!(eval(&set("color_id", Op::Eq, vec![]).negated(), &row));
        assert!(eval(&set("name", Op::Contains, vec![json!("Red"), json!("Green")]), &row));
        assert!(eval(&set("size", Op::Gt, vec![json!(30), json!(11)]), &row));
        assert!(!eval(&set("size", Op::Gt, vec![json!(30)]), &row));
    }

    #[test]
    fn test_union_semantics() {
        let row = json!({"size": 22, "name": "b"});
        let empty = Union::new("shape");
        assert!(FilterEvaluator::evaluate(&empty, &row).unwrap());

        let union = Union::new("shape")
            .with_intersection(Intersection::new(vec![
                Member::Rule(rule("size", Op::Gt, json!(11))),
                Member::Rule(rule("name", Op::Eq, json!("a"))),
            ]))
            .with_intersection(Intersection::new(vec![Member::Rule(rule(
                "name",
                Op::Eq,
                json!("b"),
            ))]));
        assert!(FilterEvaluator::evaluate(&union, &row).unwrap());

        let nested = Union::new("shape").with_intersection(Intersection::new(vec![
            Member::Rule(rule("size", Op::Eq, json!(22))),
            Member::Union(
                Union::new("shape")
                    .with_intersection(Intersection::new(vec![Member::Rule(rule(
                        "name",
                        Op::Eq,
                        json!("x"),
                    ))]))
                    .with_intersection(Intersection::new(vec![Member::Rule(rule(
                        "name",
                        Op::Eq,
                        json!("y"),
                    ))])),
            ),
        ]));
        assert!(!FilterEvaluator::evaluate(&nested, &row).unwrap());
    }

    #[test]
    fn test_unbound_reference_is_an_error() {
        let rule = Rule::new("id", Op::Eq, RuleValue::Param(ParamRef::new("id")));
        let err = FilterEvaluator::evaluate_rule(&rule, &json!({"id": 1})).unwrap_err();
        assert_eq!(err.kind, "parameter");
        assert_eq!(err.to_string(), "rule on 'id' has an unbound parameter value");
    }

    #[test]
    fn test_compare_values() {
        assert_eq!(
            FilterEvaluator::compare_values(&json!(1), &json!(2.5)),
            Some(Ordering::Less)
        );
        assert_eq!(
            FilterEvaluator::compare_values(&json!("b"), &json!("a")),
            Some(Ordering::Greater)
        );
        assert_eq!(FilterEvaluator::compare_values(&json!(1), &json!("1")), None);
        assert_eq!(FilterEvaluator::compare_values(&Value::Null, &Value::Null), None);
    }

    #[test]
    fn test_large_integers_compare_exactly() {
        let a = json!(9007199254740992u64);
        let b = json!(9007199254740993u64);
        assert!(!FilterEvaluator::values_equal(&a, &b, false));
        assert!(FilterEvaluator::values_equal(&b, &json!(9007199254740993u64), false));
        assert_eq!(FilterEvaluator::compare_values(&a, &b), Some(Ordering::Less));

        assert_eq!(
            FilterEvaluator::compare_values(&json!(-1), &json!(u64::MAX)),
            Some(Ordering::Less)
        );
        assert_eq!(
            FilterEvaluator::compare_values(&json!(u64::MAX), &json!(i64::MIN)),
            Some(Ordering::Greater)
        );
        assert!(FilterEvaluator::values_equal(&json!(2), &json!(2.0), false));

        let rule = Rule::new("id", Op::Eq, RuleValue::Static(b.clone()));
        assert!(!FilterEvaluator::evaluate_rule(&rule, &json!({"id": a})).unwrap());
        assert!(FilterEvaluator::evaluate_rule(&rule, &json!({"id": b})).unwrap());
    }
}
