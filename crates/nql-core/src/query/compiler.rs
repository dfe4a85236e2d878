//! Query compiler: splits a rule tree into single-scope parts.
//!
//! Each part holds the rules one runner can evaluate by itself. A sub-query
//! on a bucket in the same scope stays inline; a sub-query crossing into a
//! different scope becomes a new part, and the rule in the parent part is
//! rewritten to reference that part's output.

use std::collections::BTreeSet;
use std::fmt::Write as _;

use serde_json::{Map, Value};
use tracing::{debug, trace};

use super::ast::{Member, PartRef, Rule, RuleValue, SubQuery, Union};
use super::builder::RuleTreeBuilder;
use crate::catalog::Catalog;
use crate::config::CompileLimits;
use crate::error::{Error, StructuralError, StructuralErrorKind};

/// A self-contained chunk of a query executable by one runner.
#[derive(Debug, Clone, PartialEq)]
pub struct Part {
    /// Part id. Part 0 is the root.
    pub id: usize,
    /// Rule tree of the part. Cross-scope sub-queries are [`RuleValue::Part`]
    /// references.
    pub union: Union,
    /// Ids of the parts this part reads from.
    pub depends_on: Vec<usize>,
}

impl Part {
    /// Root bucket of the part.
    pub fn bucket(&self) -> &str {
        self.union.bucket()
    }

    /// Scope of the part's runner.
    pub fn scope(&self) -> &str {
        self.union.meta.scope.as_deref().unwrap_or_default()
    }

    /// Check if the part references the parameter row.
    pub fn has_param_refs(&self) -> bool {
        self.union.has_param_refs()
    }
}

/// A query split into parts with a dependency-respecting execution order.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    /// Root bucket.
    pub bucket: String,
    /// Parts indexed by id.
    pub parts: Vec<Part>,
    /// Order in which the parts run. Every part comes after the parts it
    /// depends on.
    pub exec_order: Vec<usize>,
}

impl CompiledQuery {
    /// The root part.
    pub fn root(&self) -> Option<&Part> {
        self.parts.first()
    }

    /// Get a part by id.
    pub fn part(&self, id: usize) -> Option<&Part> {
        self.parts.get(id)
    }

    /// Number of parts.
    pub fn len(&self) -> usize {
        self.parts.len()
    }

    /// Check if the query has no parts.
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Check if any part references the parameter row.
    pub fn has_param_refs(&self) -> bool {
        self.parts.iter().any(Part::has_param_refs)
    }

    /// Check that a part can be run by a runner of `scope`.
    ///
    /// Every inline sub-query must share the runner's scope and every part
    /// reference must point to a declared dependency.
    pub fn check_part(&self, id: usize, scope: &str) -> Result<(), Error> {
        let part = self.part(id).ok_or_else(|| Error::UnresolvedScope {
            part: id,
            bucket: self.bucket.clone(),
            detail: "no such part".to_string(),
        })?;

        let unresolved = |detail: String| Error::UnresolvedScope {
            part: id,
            bucket: part.bucket().to_string(),
            detail,
        };

        if part.scope() != scope {
            return Err(unresolved(format!(
                "part scope '{}' does not match runner scope '{}'",
                part.scope(),
                scope
            )));
        }

        let mut problem = None;
        part.union.visit_rules(&mut |rule| {
            if problem.is_some() {
                return;
            }
            match &rule.value {
                RuleValue::SubQuery(sub) if sub.union.meta.scope.as_deref() != Some(scope) => {
                    problem = Some(format!(
                        "inline sub-query on '{}' is outside scope '{}'",
                        sub.bucket, scope
                    ));
                }
                RuleValue::Part(r) if !part.depends_on.contains(&r.part) => {
                    problem = Some(format!("reference to undeclared part {}", r.part));
                }
                _ => {}
            }
        });

        match problem {
            Some(detail) => Err(unresolved(detail)),
            None => Ok(()),
        }
    }

    /// Human-readable plan description.
    pub fn explain(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Query on '{}' ({} part{})",
            self.bucket,
            self.parts.len(),
            if self.parts.len() == 1 { "" } else { "s" }
        );
        for part in &self.parts {
            let _ = write!(out, "  part {} [{} @ {}]", part.id, part.bucket(), part.scope());
            if !part.depends_on.is_empty() {
                let deps: Vec<String> = part.depends_on.iter().map(|d| d.to_string()).collect();
                let _ = write!(out, " depends on {}", deps.join(", "));
            }
            let _ = writeln!(out);
            let _ = writeln!(out, "    {}", part.union);
        }
        let order: Vec<String> = self.exec_order.iter().map(|id| id.to_string()).collect();
        let _ = write!(out, "  exec order: {}", order.join(" -> "));
        out
    }
}

/// Compiles query objects into [`CompiledQuery`] plans.
pub struct QueryCompiler<'a> {
    catalog: &'a Catalog,
    limits: &'a CompileLimits,
}

#[derive(Default)]
struct PartArena {
    parts: Vec<Option<Part>>,
}

impl<'a> QueryCompiler<'a> {
    /// Create a compiler over a catalog.
    pub fn new(catalog: &'a Catalog, limits: &'a CompileLimits) -> Self {
        Self { catalog, limits }
    }

    /// Compile a query on `bucket`.
    pub fn compile(
        &self,
        bucket: &str,
        query: &Map<String, Value>,
    ) -> Result<CompiledQuery, StructuralError> {
        let tree = RuleTreeBuilder::new(self.catalog, self.limits).build(bucket, query)?;
        self.partition(tree)
    }

    /// Split a rule tree into parts.
    pub fn partition(&self, tree: Union) -> Result<CompiledQuery, StructuralError> {
        let bucket = tree.bucket().to_string();
        let mut arena = PartArena::default();
        self.split(&mut arena, tree)?;

        let parts: Vec<Part> = arena.parts.into_iter().flatten().collect();
        let deps: Vec<Vec<usize>> = parts.iter().map(|p| p.depends_on.clone()).collect();
        let exec_order = execution_order(&deps).ok_or_else(|| {
            StructuralError::new(
                StructuralErrorKind::CyclicPlan,
                format!("part dependencies of '{}' form a cycle", bucket),
            )
        })?;

        debug!(
            bucket = %bucket,
            parts = parts.len(),
            order = ?exec_order,
            "Compiled query"
        );

        Ok(CompiledQuery {
            bucket,
            parts,
            exec_order,
        })
    }

    /// Create a part for `union`, recursing into cross-scope sub-queries.
    /// Ids are assigned in pre-order.
    fn split(&self, arena: &mut PartArena, mut union: Union) -> Result<usize, StructuralError> {
        let id = arena.parts.len();
        if id >= self.limits.max_parts {
            return Err(StructuralError::limit_exceeded(format!(
                "query needs more than {} parts",
                self.limits.max_parts
            )));
        }
        arena.parts.push(None);

        let scope = self.scope_of(union.bucket())?;
        union.meta.scope = Some(scope.clone());

        let mut depends_on = Vec::new();
        self.resolve_union(arena, &mut union, &scope, &mut depends_on)?;

        trace!(part = id, bucket = %union.bucket(), scope = %scope, deps = ?depends_on, "Created part");
        arena.parts[id] = Some(Part {
            id,
            union,
            depends_on,
        });
        Ok(id)
    }

    fn resolve_union(
        &self,
        arena: &mut PartArena,
        union: &mut Union,
        scope: &str,
        depends_on: &mut Vec<usize>,
    ) -> Result<(), StructuralError> {
        for intersection in &mut union.intersections {
            for member in &mut intersection.members {
                match member {
                    Member::Rule(rule) => self.resolve_rule(arena, rule, scope, depends_on)?,
                    Member::Union(nested) => {
                        nested.meta.scope = Some(scope.to_string());
                        self.resolve_union(arena, nested, scope, depends_on)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn resolve_rule(
        &self,
        arena: &mut PartArena,
        rule: &mut Rule,
        scope: &str,
        depends_on: &mut Vec<usize>,
    ) -> Result<(), StructuralError> {
        let target = match &rule.value {
            RuleValue::SubQuery(sub) => sub.bucket.clone(),
            _ => return Ok(()),
        };
        let target_scope = self.scope_of(&target)?;

        if target_scope == scope {
            if let RuleValue::SubQuery(sub) = &mut rule.value {
                sub.union.meta.scope = Some(target_scope);
                self.resolve_union(arena, &mut sub.union, scope, depends_on)?;
            }
            return Ok(());
        }

        let value = std::mem::replace(&mut rule.value, RuleValue::Values(Vec::new()));
        if let RuleValue::SubQuery(sub) = value {
            let SubQuery { field, union, .. } = *sub;
            let child = self.split(arena, union)?;
            rule.value = RuleValue::Part(PartRef { part: child, field });
            if !depends_on.contains(&child) {
                depends_on.push(child);
            }
        }
        Ok(())
    }

    fn scope_of(&self, bucket: &str) -> Result<String, StructuralError> {
        self.catalog
            .scope_of(bucket)
            .ok_or_else(|| StructuralError::unknown_bucket(bucket))
    }
}

/// Order parts so every part follows its dependencies.
///
/// `deps[i]` lists the parts part `i` depends on. When several parts are
/// ready, the lowest id runs first. Returns `None` if the dependencies form
/// a cycle or reference a missing part.
pub fn execution_order(deps: &[Vec<usize>]) -> Option<Vec<usize>> {
    let n = deps.len();
    let mut remaining: Vec<usize> = deps.iter().map(Vec::len).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (part, part_deps) in deps.iter().enumerate() {
        for &dep in part_deps {
            dependents.get_mut(dep)?.push(part);
        }
    }

    let mut ready: BTreeSet<usize> = (0..n).filter(|&i| remaining[i] == 0).collect();
    let mut order = Vec::with_capacity(n);

    while let Some(next) = ready.pop_first() {
        order.push(next);
        for &dependent in &dependents[next] {
            remaining[dependent] -= 1;
            if remaining[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }

    (order.len() == n).then_some(order)
}
