//! Parser from query objects to rule trees.

use serde_json::{Map, Value};
use tracing::trace;

use super::ast::{
    Intersection, Member, Op, ParamRef, Rule, RuleValue, SubQuery, TemplateRef, Union,
};
use crate::catalog::{BucketDef, Catalog};
use crate::config::CompileLimits;
use crate::error::{StructuralError, StructuralErrorKind};

/// Prefix joining a key into a new intersection.
const OR_PREFIX: &str = "or ";

/// Kind of a `#and` / `#or` group key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroupKind {
    And,
    Or,
}

/// Builds a [`Union`] rule tree from a query object.
///
/// Keys are read in declaration order. A plain key adds a rule to the
/// current intersection, an `or ` prefix starts a new intersection, and
/// `#and` / `#or` groups nest a query object on the same bucket.
pub struct RuleTreeBuilder<'a> {
    catalog: &'a Catalog,
    limits: &'a CompileLimits,
}

impl<'a> RuleTreeBuilder<'a> {
    /// Create a builder over a catalog.
    pub fn new(catalog: &'a Catalog, limits: &'a CompileLimits) -> Self {
        Self { catalog, limits }
    }

    /// Build the rule tree of a query on `bucket`.
    pub fn build(&self, bucket: &str, query: &Map<String, Value>) -> Result<Union, StructuralError> {
        let def = self.bucket_def(bucket)?;
        self.build_union(&def, query, 0)
    }

    fn bucket_def(&self, bucket: &str) -> Result<BucketDef, StructuralError> {
        self.catalog
            .get(bucket)
            .map(|registered| registered.def)
            .ok_or_else(|| StructuralError::unknown_bucket(bucket))
    }

    fn build_union(
        &self,
        bucket: &BucketDef,
        query: &Map<String, Value>,
        depth: usize,
    ) -> Result<Union, StructuralError> {
        let mut intersections = vec![Intersection::default()];
        let mut current = 0;

        for (raw_key, value) in query {
            let key = match raw_key.strip_prefix(OR_PREFIX) {
                Some(rest) => {
                    if !intersections[current].is_empty() {
                        intersections.push(Intersection::default());
                        current = intersections.len() - 1;
                    }
                    rest.trim_start()
                }
                None => raw_key.as_str(),
            };

            if let Some(group) = key.strip_prefix('#') {
                let kind = parse_group_key(raw_key, group)?;
                let nested = value
                    .as_object()
                    .ok_or_else(|| StructuralError::malformed_group(raw_key, "expected an object"))?;
                let union = self.build_union(bucket, nested, depth)?;
                match kind {
                    GroupKind::And => match union.intersections.len() {
                        0 => {}
                        1 => {
                            let mut alternatives = union.intersections;
                            if let Some(only) = alternatives.pop() {
                                intersections[current].members.extend(only.members);
                            }
                        }
                        _ => intersections[current].members.push(Member::Union(union)),
                    },
                    GroupKind::Or => intersections.extend(union.intersections),
                }
                continue;
            }

            let rule = self.build_rule(bucket, raw_key, key, value, depth)?;
            trace!(bucket = %bucket.name, rule = %rule, "Parsed rule");
            intersections[current].members.push(Member::Rule(rule));
        }

        intersections.retain(|i| !i.is_empty());

        let mut union = Union::new(bucket.name.clone());
        union.intersections = intersections;
        Ok(union)
    }

    fn build_rule(
        &self,
        bucket: &BucketDef,
        raw_key: &str,
        key: &str,
        value: &Value,
        depth: usize,
    ) -> Result<Rule, StructuralError> {
        let mut tokens = key.split_whitespace();
        let fieldpath = tokens.next().ok_or_else(|| {
            StructuralError::new(
                StructuralErrorKind::EmptyFieldPath,
                format!("key '{}' has no field path", raw_key),
            )
            .with_key(raw_key)
        })?;

        let mut not = false;
        let mut case_insensitive = false;
        let mut op = None;

        for token in tokens {
            if token == "not" {
                if not {
                    return Err(StructuralError::invalid_modifier(raw_key, "'not' repeated"));
                }
                not = true;
                continue;
            }
            if token == "~" {
                case_insensitive = true;
                continue;
            }
            let (tilde, op_token) = match token.strip_prefix('~') {
                Some(rest) => (true, rest),
                None => (false, token),
            };
            let parsed =
                Op::parse(op_token).ok_or_else(|| StructuralError::unknown_operator(raw_key, token))?;
            if op.is_some() {
                return Err(StructuralError::invalid_modifier(
                    raw_key,
                    "more than one operator",
                ));
            }
            op = Some(parsed);
            case_insensitive |= tilde;
        }

        let op = op.unwrap_or(Op::Eq);
        if case_insensitive && !op.supports_case_insensitive() {
            return Err(StructuralError::invalid_modifier(
                raw_key,
                format!("'~' does not apply to '{}'", op),
            ));
        }

        if !bucket.has_field(fieldpath) {
            return Err(StructuralError::unknown_field(&bucket.name, fieldpath).with_key(raw_key));
        }

        let value = self.classify_value(raw_key, op, value, depth)?;

        Ok(Rule {
            fieldpath: fieldpath.to_string(),
            op,
            not,
            case_insensitive,
            value,
        })
    }

    fn classify_value(
        &self,
        key: &str,
        op: Op,
        value: &Value,
        depth: usize,
    ) -> Result<RuleValue, StructuralError> {
        if let Value::Object(map) = value {
            if map.len() == 1 {
                if let Some((marker, inner)) = map.iter().next() {
                    if marker == "." {
                        let path = marker_path(key, inner)?;
                        return Ok(RuleValue::Param(ParamRef::new(path)));
                    }
                    if marker == "$" {
                        let template = TemplateRef::new(marker_path(key, inner)?);
                        if !template.has_placeholder() {
                            return Err(StructuralError::malformed_marker(
                                key,
                                "template path has no '$N' placeholder",
                            ));
                        }
                        return Ok(RuleValue::Template(template));
                    }
                    if let Some(target) = marker.strip_prefix('@') {
                        return self.build_sub_query(key, target, inner, depth);
                    }
                }
            }
        }

        validate_static(key, op, value)?;
        Ok(RuleValue::Static(value.clone()))
    }

    fn build_sub_query(
        &self,
        key: &str,
        target: &str,
        query: &Value,
        depth: usize,
    ) -> Result<RuleValue, StructuralError> {
        let (bucket_name, field) = target
            .split_once('.')
            .filter(|(bucket, field)| !bucket.is_empty() && !field.is_empty())
            .ok_or_else(|| {
                StructuralError::malformed_marker(key, format!("'@{}' is not '@bucket.field'", target))
            })?;

        if depth + 1 > self.limits.max_depth {
            return Err(StructuralError::limit_exceeded(format!(
                "sub-query depth exceeds {}",
                self.limits.max_depth
            ))
            .with_key(key));
        }

        let def = self.bucket_def(bucket_name).map_err(|e| e.with_key(key))?;
        if !def.has_field(field) {
            return Err(StructuralError::unknown_field(bucket_name, field).with_key(key));
        }

        let nested = query
            .as_object()
            .ok_or_else(|| StructuralError::malformed_marker(key, "sub-query must be an object"))?;
        let union = self.build_union(&def, nested, depth + 1)?;

        Ok(RuleValue::SubQuery(Box::new(SubQuery {
            bucket: bucket_name.to_string(),
            field: field.to_string(),
            union,
        })))
    }
}

/// Parse the part of a group key after `#`.
///
/// Anything after `and` / `or` must start with a non-alphanumeric
/// character, so `#and 1` and `#or_b` are valid while `#order` is not.
fn parse_group_key(raw_key: &str, group: &str) -> Result<GroupKind, StructuralError> {
    let (kind, suffix) = if let Some(rest) = group.strip_prefix("and") {
        (GroupKind::And, rest)
    } else if let Some(rest) = group.strip_prefix("or") {
        (GroupKind::Or, rest)
    } else {
        return Err(StructuralError::malformed_group(
            raw_key,
            "expected '#and' or '#or'",
        ));
    };

    match suffix.chars().next() {
        Some(c) if c.is_alphanumeric() => Err(StructuralError::malformed_group(
            raw_key,
            "expected '#and' or '#or'",
        )),
        _ => Ok(kind),
    }
}

fn marker_path<'v>(key: &str, value: &'v Value) -> Result<&'v str, StructuralError> {
    match value.as_str() {
        Some(path) if !path.is_empty() => Ok(path),
        _ => Err(StructuralError::malformed_marker(
            key,
            "reference path must be a non-empty string",
        )),
    }
}

fn validate_static(key: &str, op: Op, value: &Value) -> Result<(), StructuralError> {
    match op {
        Op::In | Op::ContainsAny if !value.is_array() => Err(StructuralError::invalid_value(
            key,
            format!("'{}' expects an array", op),
        )),
        Op::Contains if !value.is_string() => Err(StructuralError::invalid_value(
            key,
            "'contains' expects a string",
        )),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::MemoryRunner;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;

    fn catalog() -> Catalog {
        let catalog = Catalog::new();
        let runner = Arc::new(MemoryRunner::new("db"));
        catalog.register(BucketDef::new("shape"), runner.clone());
        catalog.register(BucketDef::new("color"), runner.clone());
        catalog.register(
            BucketDef::new("tag").with_fields(["name", "scope"]),
            runner,
        );
        catalog
    }

    fn build(catalog: &Catalog, bucket: &str, query: Value) -> Result<Union, StructuralError> {
        let limits = CompileLimits::default();
        let map = query.as_object().cloned().unwrap();
        RuleTreeBuilder::new(catalog, &limits).build(bucket, &map)
    }

    #[test]
    fn test_key_tokens() {
        let catalog = catalog();
        let union = build(
            &catalog,
            "shape",
            json!({
                "size": 11,
                "name not ~contains": "x",
                "tags ~": "red",
                "size not >=": 30,
            }),
        )
        .unwrap();

        assert_eq!(union.intersections.len(), 1);
        assert_eq!(
            union.to_string(),
            r#"(size == 11 and name not ~contains "x" and tags ~== "red" and size not >= 30)"#
        );
    }

    #[test]
    fn test_or_prefix_starts_new_intersection() {
        let catalog = catalog();
        let union = build(
            &catalog,
            "shape",
            json!({"size": 11, "or size >": 20, "name": "a"}),
        )
        .unwrap();

        assert_eq!(
            union.to_string(),
            r#"(size == 11 or size > 20 and name == "a")"#
        );
    }

    #[test]
    fn test_leading_or_does_not_leave_empty_alternative() {
        let catalog = catalog();
        let union = build(&catalog, "shape", json!({"or size": 1, "or size >": 5})).unwrap();
        assert_eq!(union.to_string(), "(size == 1 or size > 5)");
    }

    #[test]
    fn test_groups() {
        let catalog = catalog();
        let union = build(
            &catalog,
            "shape",
            json!({
                "name": "a",
                "#and": {"size >": 1, "size <": 5},
                "#and 2": {"size": 1, "or size": 2},
                "#or": {"id": 9},
            }),
        )
        .unwrap();

        assert_eq!(
            union.to_string(),
            r#"(name == "a" and size > 1 and size < 5 and (size == 1 or size == 2) or id == 9)"#
        );
    }

    #[test]
    fn test_or_and_group_starts_new_intersection() {
        let catalog = catalog();
        let union = build(
            &catalog,
            "shape",
            json!({"size": 1, "or #and": {"size": 2, "name": "b"}}),
        )
        .unwrap();
        assert_eq!(union.to_string(), r#"(size == 1 or size == 2 and name == "b")"#);
    }

    #[test]
    fn test_malformed_groups() {
        let catalog = catalog();
        for query in [
            json!({"#order": {"size": 1}}),
            json!({"#xor": {"size": 1}}),
            json!({"#and": 5}),
        ] {
            let err = build(&catalog, "shape", query).unwrap_err();
            assert_eq!(err.kind, StructuralErrorKind::MalformedGroup);
        }
        assert!(build(&catalog, "shape", json!({"#or_1": {"size": 1}})).is_ok());
    }

    #[test]
    fn test_value_markers() {
        let catalog = catalog();
        let union = build(
            &catalog,
            "shape",
            json!({
                "id": {".": "shape_id"},
                "color_id": {".": "color.id"},
                "name": {"$": "ref.$0"},
                "meta": {"other": 1},
            }),
        )
        .unwrap();

        let mut values = Vec::new();
        union.visit_rules(&mut |rule| values.push(rule.value.clone()));
        assert_eq!(
            values,
            vec![
                RuleValue::Param(ParamRef {
                    path: "shape_id".into(),
                    deep: false
                }),
                RuleValue::Param(ParamRef {
                    path: "color.id".into(),
                    deep: true
                }),
                RuleValue::Template(TemplateRef::new("ref.$0")),
                RuleValue::Static(json!({"other": 1})),
            ]
        );
    }

    #[test]
    fn test_sub_query() {
        let catalog = catalog();
        let union = build(
            &catalog,
            "shape",
            json!({"color_id in": {"@color.id": {"name": "Red"}}}),
        )
        .unwrap();
        assert_eq!(
            union.to_string(),
            r#"(color_id in @color.id (name == "Red"))"#
        );
    }

    #[test]
    fn test_structural_errors() {
        let catalog = catalog();
        let cases = [
            (json!({"size >>": 1}), StructuralErrorKind::UnknownOperator),
            (json!({"size not not": 1}), StructuralErrorKind::InvalidModifier),
            (json!({"size == >": 1}), StructuralErrorKind::InvalidModifier),
            (json!({"size ~>": 1}), StructuralErrorKind::InvalidModifier),
            (json!({"size in": 1}), StructuralErrorKind::InvalidValue),
            (json!({"name contains": 1}), StructuralErrorKind::InvalidValue),
            (json!({"name": {".": ""}}), StructuralErrorKind::MalformedMarker),
            (json!({"name": {"$": "ref"}}), StructuralErrorKind::MalformedMarker),
            (json!({"id": {"@color": {}}}), StructuralErrorKind::MalformedMarker),
            (json!({"id": {"@paint.id": {}}}), StructuralErrorKind::UnknownBucket),
            (json!({"id": {"@tag.kind": {}}}), StructuralErrorKind::UnknownField),
            (json!({"id": {"@tag.id": {"kind": 1}}}), StructuralErrorKind::UnknownField),
            (json!({"or ": 1}), StructuralErrorKind::EmptyFieldPath),
        ];

        for (query, kind) in cases {
            let err = build(&catalog, "shape", query.clone()).unwrap_err();
            assert_eq!(err.kind, kind, "query: {}", query);
        }

        let err = build(&catalog, "paint", json!({})).unwrap_err();
        assert_eq!(err.kind, StructuralErrorKind::UnknownBucket);
    }

    #[test]
    fn test_depth_limit() {
        let catalog = catalog();
        let limits = CompileLimits::new(1, 8);
        let query = json!({
            "color_id": {"@color.id": {"tag_id": {"@tag.id": {"name": "x"}}}}
        });
        let map = query.as_object().cloned().unwrap();
        let err = RuleTreeBuilder::new(&catalog, &limits)
            .build("shape", &map)
            .unwrap_err();
        assert_eq!(err.kind, StructuralErrorKind::LimitExceeded);
    }

    #[test]
    fn test_empty_query_matches_everything() {
        let catalog = catalog();
        let union = build(&catalog, "shape", json!({})).unwrap();
        assert!(union.is_empty());
        assert!(union.intersections.is_empty());
    }
}
