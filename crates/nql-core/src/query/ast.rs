//! Rule tree produced from a query object.
//!
//! A query compiles into a [`Union`] of [`Intersection`]s. Each intersection
//! holds [`Member`]s that must all match: either a single [`Rule`] or a
//! nested union (from an `#and` group with several alternatives).

use std::fmt;

use nql_proto::Template;
use serde_json::Value;

/// Comparison operator of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    /// `==` equality (the default).
    Eq,
    /// `>`
    Gt,
    /// `<`
    Lt,
    /// `>=`
    Gte,
    /// `<=`
    Lte,
    /// `in` membership in a list.
    In,
    /// `contains` substring match.
    Contains,
    /// `contains_any` substring match against any of a list.
    ContainsAny,
    /// `present` field is set and non-empty.
    Present,
}

impl Op {
    /// Parse an operator token.
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "==" => Some(Op::Eq),
            ">" => Some(Op::Gt),
            "<" => Some(Op::Lt),
            ">=" => Some(Op::Gte),
            "<=" => Some(Op::Lte),
            "in" => Some(Op::In),
            "contains" => Some(Op::Contains),
            "contains_any" => Some(Op::ContainsAny),
            "present" => Some(Op::Present),
            _ => None,
        }
    }

    /// The operator token.
    pub fn as_str(&self) -> &'static str {
        match self {
            Op::Eq => "==",
            Op::Gt => ">",
            Op::Lt => "<",
            Op::Gte => ">=",
            Op::Lte => "<=",
            Op::In => "in",
            Op::Contains => "contains",
            Op::ContainsAny => "contains_any",
            Op::Present => "present",
        }
    }

    /// Whether the `~` case-insensitive modifier applies to this operator.
    pub fn supports_case_insensitive(&self) -> bool {
        matches!(self, Op::Eq | Op::In | Op::Contains | Op::ContainsAny)
    }

    /// Whether this is an ordering comparison.
    pub fn is_ordering(&self) -> bool {
        matches!(self, Op::Gt | Op::Lt | Op::Gte | Op::Lte)
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to a value of the current parameter row: `{'.': path}`.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamRef {
    /// Path into the parameter row.
    pub path: String,
    /// The path descends into nested objects.
    pub deep: bool,
}

impl ParamRef {
    /// Create a parameter reference.
    pub fn new(path: impl Into<String>) -> Self {
        let path = path.into();
        let deep = path.contains('.');
        Self { path, deep }
    }
}

/// Reference to a parameter value through a template: `{'$': 'ref.$0'}`.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateRef {
    /// Path with `$N` placeholders.
    pub path: String,
}

impl TemplateRef {
    /// Create a template reference.
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    /// Check if the path contains at least one `$N` placeholder.
    pub fn has_placeholder(&self) -> bool {
        self.path.split('.').any(|seg| placeholder_index(seg).is_some())
    }

    /// Substitute the `$N` placeholders with entries of `template`.
    ///
    /// Returns `None` when a placeholder points past the end of the template.
    pub fn resolve(&self, template: &Template) -> Option<String> {
        let mut segments = Vec::new();
        for segment in self.path.split('.') {
            match placeholder_index(segment) {
                Some(index) => segments.push(template.get(index)?.as_str()),
                None => segments.push(segment),
            }
        }
        Some(segments.join("."))
    }
}

fn placeholder_index(segment: &str) -> Option<usize> {
    let digits = segment.strip_prefix('$')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// A nested query on another bucket: `{'@bucket.field': {...}}`.
///
/// Produces the set of `field` values of the matching rows. Only kept inline
/// when the bucket shares the enclosing part's scope.
#[derive(Debug, Clone, PartialEq)]
pub struct SubQuery {
    /// Bucket queried.
    pub bucket: String,
    /// Field projected from the matching rows.
    pub field: String,
    /// Rule tree of the nested query.
    pub union: Union,
}

/// Reference to the output of another part.
#[derive(Debug, Clone, PartialEq)]
pub struct PartRef {
    /// Id of the part producing the values.
    pub part: usize,
    /// Field projected from the part's rows.
    pub field: String,
}

/// Value side of a rule.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleValue {
    /// A literal.
    Static(Value),
    /// A parameter row value.
    Param(ParamRef),
    /// A parameter row value found through a template.
    Template(TemplateRef),
    /// An inlined same-scope sub-query.
    SubQuery(Box<SubQuery>),
    /// The output of another part.
    Part(PartRef),
    /// A resolved set of values (a sub-query or part output).
    Values(Vec<Value>),
}

impl RuleValue {
    /// Check if the value still needs a parameter row.
    pub fn is_param_ref(&self) -> bool {
        matches!(self, RuleValue::Param(_) | RuleValue::Template(_))
    }
}

impl fmt::Display for RuleValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleValue::Static(value) => write!(f, "{}", value),
            RuleValue::Param(param) => write!(f, "{{.{}}}", param.path),
            RuleValue::Template(template) => write!(f, "{{${}}}", template.path),
            RuleValue::SubQuery(sub) => write!(f, "@{}.{} {}", sub.bucket, sub.field, sub.union),
            RuleValue::Part(part) => write!(f, "@part[{}].{}", part.part, part.field),
            RuleValue::Values(values) => write!(f, "{}", Value::Array(values.clone())),
        }
    }
}

/// A single field comparison.
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    /// Dot-delimited field path tested on each row.
    pub fieldpath: String,
    /// Comparison operator.
    pub op: Op,
    /// Negate the result.
    pub not: bool,
    /// Compare case-insensitively.
    pub case_insensitive: bool,
    /// Value compared against.
    pub value: RuleValue,
}

impl Rule {
    /// Create a rule.
    pub fn new(fieldpath: impl Into<String>, op: Op, value: RuleValue) -> Self {
        Self {
            fieldpath: fieldpath.into(),
            op,
            not: false,
            case_insensitive: false,
            value,
        }
    }

    /// Negate the rule.
    pub fn negated(mut self) -> Self {
        self.not = true;
        self
    }

    /// Compare case-insensitively.
    pub fn case_insensitive(mut self) -> Self {
        self.case_insensitive = true;
        self
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ", self.fieldpath)?;
        if self.not {
            write!(f, "not ")?;
        }
        if self.case_insensitive {
            write!(f, "~")?;
        }
        write!(f, "{} {}", self.op, self.value)
    }
}

/// Member of an intersection.
#[derive(Debug, Clone, PartialEq)]
pub enum Member {
    /// A single rule.
    Rule(Rule),
    /// A nested union.
    Union(Union),
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Member::Rule(rule) => write!(f, "{}", rule),
            Member::Union(union) => write!(f, "{}", union),
        }
    }
}

/// Conjunction of members. Empty means no constraint.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Intersection {
    /// Members that must all match.
    pub members: Vec<Member>,
}

impl Intersection {
    /// Create an intersection from members.
    pub fn new(members: Vec<Member>) -> Self {
        Self { members }
    }

    /// Check if the intersection has no members.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

impl fmt::Display for Intersection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.members.is_empty() {
            return write!(f, "true");
        }
        for (i, member) in self.members.iter().enumerate() {
            if i > 0 {
                write!(f, " and ")?;
            }
            write!(f, "{}", member)?;
        }
        Ok(())
    }
}

/// Bucket and scope a union is evaluated on.
#[derive(Debug, Clone, PartialEq)]
pub struct UnionMeta {
    /// Bucket the union selects from.
    pub bucket: String,
    /// Scope of the bucket's runner, set by the compiler.
    pub scope: Option<String>,
}

/// Disjunction of intersections. Empty means no constraint.
#[derive(Debug, Clone, PartialEq)]
pub struct Union {
    /// Bucket and scope metadata.
    pub meta: UnionMeta,
    /// Alternatives, any of which may match.
    pub intersections: Vec<Intersection>,
}

impl Union {
    /// Create an empty union on a bucket.
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            meta: UnionMeta {
                bucket: bucket.into(),
                scope: None,
            },
            intersections: Vec::new(),
        }
    }

    /// Add an intersection.
    pub fn with_intersection(mut self, intersection: Intersection) -> Self {
        self.intersections.push(intersection);
        self
    }

    /// Bucket the union selects from.
    pub fn bucket(&self) -> &str {
        &self.meta.bucket
    }

    /// Check if the union places no constraint.
    pub fn is_empty(&self) -> bool {
        self.intersections.iter().all(Intersection::is_empty)
    }

    /// Visit every rule, including those of nested unions and inlined
    /// sub-queries.
    pub fn visit_rules<F: FnMut(&Rule)>(&self, f: &mut F) {
        for intersection in &self.intersections {
            for member in &intersection.members {
                match member {
                    Member::Rule(rule) => {
                        f(rule);
                        if let RuleValue::SubQuery(sub) = &rule.value {
                            sub.union.visit_rules(f);
                        }
                    }
                    Member::Union(union) => union.visit_rules(f),
                }
            }
        }
    }

    /// Mutable variant of [`Union::visit_rules`].
    pub fn visit_rules_mut<F: FnMut(&mut Rule)>(&mut self, f: &mut F) {
        for intersection in &mut self.intersections {
            for member in &mut intersection.members {
                match member {
                    Member::Rule(rule) => {
                        f(rule);
                        if let RuleValue::SubQuery(sub) = &mut rule.value {
                            sub.union.visit_rules_mut(f);
                        }
                    }
                    Member::Union(union) => union.visit_rules_mut(f),
                }
            }
        }
    }

    /// Check if any rule references the parameter row.
    pub fn has_param_refs(&self) -> bool {
        let mut found = false;
        self.visit_rules(&mut |rule| found |= rule.value.is_param_ref());
        found
    }

    /// Check if any rule references the parameter row through a template.
    pub fn has_template_refs(&self) -> bool {
        let mut found = false;
        self.visit_rules(&mut |rule| found |= matches!(rule.value, RuleValue::Template(_)));
        found
    }

    /// Ids of the parts referenced by this union, in first-seen order.
    pub fn part_refs(&self) -> Vec<usize> {
        let mut parts = Vec::new();
        self.visit_rules(&mut |rule| {
            if let RuleValue::Part(part) = &rule.value {
                if !parts.contains(&part.part) {
                    parts.push(part.part);
                }
            }
        });
        parts
    }
}

impl fmt::Display for Union {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.intersections.is_empty() {
            return write!(f, "(true)");
        }
        write!(f, "(")?;
        for (i, intersection) in self.intersections.iter().enumerate() {
            if i > 0 {
                write!(f, " or ")?;
            }
            write!(f, "{}", intersection)?;
        }
        write!(f, ")")
    }
}
