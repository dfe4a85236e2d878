//! Binding of parameter rows into rule trees.
//!
//! For a batched evaluation every parameter row needs its own version of
//! the part's rule tree, with `{'.': ..}` and `{'$': ..}` references
//! replaced by the row's values. The binder plans the fewest evaluations
//! that produce every row's result:
//!
//! - rows are grouped by the first template under which all template
//!   references resolve; rows no template resolves are excluded,
//! - rows binding to identical values share one evaluation,
//! - with coalescing enabled, a lone `==` parameter rule is evaluated once
//!   as a membership test and its results fanned back out per row.

use std::collections::HashMap;

use nql_proto::{get_path, ParamRow, Template};
use serde_json::Value;
use tracing::trace;

use super::ast::{Member, Op, RuleValue, TemplateRef, Union};
use super::filter::FilterEvaluator;

/// Parameter rows resolved by the same template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateGroup {
    /// Index of the template, or `None` if the tree has no template refs.
    pub template: Option<usize>,
    /// Parameter row indexes, ascending.
    pub rows: Vec<usize>,
}

/// Distributes the rows of a coalesced evaluation back to parameter rows.
#[derive(Debug, Clone, PartialEq)]
pub struct Fanout {
    /// Field path compared against the bound values.
    pub fieldpath: String,
    /// Each distinct bound value with the parameter rows that bound it.
    pub targets: Vec<(Value, Vec<usize>)>,
}

impl Fanout {
    /// Parameter rows a result row belongs to.
    pub fn matching_rows(&self, row: &Value) -> Vec<usize> {
        let field = get_path(row, &self.fieldpath).unwrap_or(&Value::Null);
        self.targets
            .iter()
            .filter(|(value, _)| FilterEvaluator::values_equal(field, value, false))
            .flat_map(|(_, rows)| rows.iter().copied())
            .collect()
    }
}

/// One evaluation of a bound rule tree.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundCall {
    /// Rule tree with every parameter reference bound.
    pub union: Union,
    /// Parameter rows served by this evaluation.
    pub rows: Vec<usize>,
    /// Set when the evaluation was coalesced.
    pub fanout: Option<Fanout>,
}

/// Evaluations needed to answer every parameter row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BindPlan {
    /// Evaluations to run.
    pub calls: Vec<BoundCall>,
    /// Parameter rows no template resolved. Their result is empty.
    pub excluded: Vec<usize>,
}

/// Binds parameter rows into rule trees.
pub struct ParamBinder<'a> {
    params: &'a [ParamRow],
    templates: &'a [Template],
    coalesce: bool,
}

impl<'a> ParamBinder<'a> {
    /// Create a binder over parameter rows and candidate templates.
    pub fn new(params: &'a [ParamRow], templates: &'a [Template]) -> Self {
        Self {
            params,
            templates,
            coalesce: false,
        }
    }

    /// Enable or disable coalescing.
    pub fn with_coalescing(mut self, coalesce: bool) -> Self {
        self.coalesce = coalesce;
        self
    }

    /// Group parameter rows by the first template that resolves them.
    ///
    /// Returns the non-empty groups and the excluded row indexes.
    pub fn group(&self, union: &Union) -> (Vec<TemplateGroup>, Vec<usize>) {
        let mut refs: Vec<TemplateRef> = Vec::new();
        union.visit_rules(&mut |rule| {
            if let RuleValue::Template(template) = &rule.value {
                refs.push(template.clone());
            }
        });

        if refs.is_empty() {
            let group = TemplateGroup {
                template: None,
                rows: (0..self.params.len()).collect(),
            };
            return (vec![group], Vec::new());
        }

        let mut groups: Vec<TemplateGroup> = (0..self.templates.len())
            .map(|i| TemplateGroup {
                template: Some(i),
                rows: Vec::new(),
            })
            .collect();
        let mut excluded = Vec::new();

        for (index, row) in self.params.iter().enumerate() {
            let resolved = self.templates.iter().position(|template| {
                refs.iter().all(|r| {
                    r.resolve(template)
                        .and_then(|path| get_path(row, &path))
                        .is_some_and(|value| !value.is_null())
                })
            });
            match resolved {
                Some(t) => groups[t].rows.push(index),
                None => excluded.push(index),
            }
        }

        groups.retain(|g| !g.rows.is_empty());
        (groups, excluded)
    }

    /// Bind one parameter row into a copy of `union`.
    ///
    /// Missing values bind as `null`.
    pub fn bind(&self, union: &Union, row: &ParamRow, template: Option<&Template>) -> Union {
        self.bind_values(union, row, template).0
    }

    fn bind_values(
        &self,
        union: &Union,
        row: &ParamRow,
        template: Option<&Template>,
    ) -> (Union, Vec<Value>) {
        let mut bound = union.clone();
        let mut values = Vec::new();
        bound.visit_rules_mut(&mut |rule| {
            if let Some(value) = resolve(&rule.value, row, template) {
                values.push(value.clone());
                rule.value = RuleValue::Static(value);
            }
        });
        (bound, values)
    }

    /// Plan the evaluations for every parameter row.
    pub fn plan(&self, union: &Union) -> BindPlan {
        let (groups, excluded) = self.group(union);
        let coalesce_at = if self.coalesce {
            coalescible_member(union)
        } else {
            None
        };

        let mut calls = Vec::new();
        for group in groups {
            let template = group.template.and_then(|t| self.templates.get(t));
            match coalesce_at {
                Some(index) => {
                    if let Some(call) = self.coalesced_call(union, index, group.rows, template) {
                        calls.push(call);
                    }
                }
                None => self.push_deduplicated(&mut calls, union, group.rows, template),
            }
        }

        trace!(
            rows = self.params.len(),
            calls = calls.len(),
            excluded = excluded.len(),
            "Planned parameter binding"
        );
        BindPlan { calls, excluded }
    }

    fn coalesced_call(
        &self,
        union: &Union,
        index: usize,
        rows: Vec<usize>,
        template: Option<&Template>,
    ) -> Option<BoundCall> {
        let mut bound = union.clone();
        let Member::Rule(rule) = bound.intersections.first_mut()?.members.get_mut(index)? else {
            return None;
        };

        let mut targets: Vec<(Value, Vec<usize>)> = Vec::new();
        let mut seen: HashMap<String, usize> = HashMap::new();
        for &row in &rows {
            let value = resolve(&rule.value, &self.params[row], template)?;
            let slot = *seen.entry(value.to_string()).or_insert_with(|| {
                targets.push((value, Vec::new()));
                targets.len() - 1
            });
            targets[slot].1.push(row);
        }

        rule.value = RuleValue::Values(targets.iter().map(|(v, _)| v.clone()).collect());
        let fanout = Fanout {
            fieldpath: rule.fieldpath.clone(),
            targets,
        };

        Some(BoundCall {
            union: bound,
            rows,
            fanout: Some(fanout),
        })
    }

    fn push_deduplicated(
        &self,
        calls: &mut Vec<BoundCall>,
        union: &Union,
        rows: Vec<usize>,
        template: Option<&Template>,
    ) {
        let mut seen: HashMap<String, usize> = HashMap::new();
        for row in rows {
            let (bound, values) = self.bind_values(union, &self.params[row], template);
            let key = Value::Array(values).to_string();
            match seen.get(&key) {
                Some(&call) => calls[call].rows.push(row),
                None => {
                    seen.insert(key, calls.len());
                    calls.push(BoundCall {
                        union: bound,
                        rows: vec![row],
                        fanout: None,
                    });
                }
            }
        }
    }
}

fn resolve(value: &RuleValue, row: &ParamRow, template: Option<&Template>) -> Option<Value> {
    match value {
        RuleValue::Param(param) => Some(get_path(row, &param.path).cloned().unwrap_or(Value::Null)),
        RuleValue::Template(reference) => Some(
            template
                .and_then(|t| reference.resolve(t))
                .and_then(|path| get_path(row, &path).cloned())
                .unwrap_or(Value::Null),
        ),
        _ => None,
    }
}

/// Index of the member that can be coalesced, if the tree allows it.
///
/// Only a single-intersection tree whose one parameter reference is a
/// direct, plain `==` rule qualifies.
fn coalescible_member(union: &Union) -> Option<usize> {
    if union.intersections.len() != 1 {
        return None;
    }
    let mut refs = 0;
    union.visit_rules(&mut |rule| {
        if rule.value.is_param_ref() {
            refs += 1;
        }
    });
    if refs != 1 {
        return None;
    }

    union.intersections[0].members.iter().position(|member| {
        matches!(
            member,
            Member::Rule(rule)
                if rule.value.is_param_ref()
                    && rule.op == Op::Eq
                    && !rule.not
                    && !rule.case_insensitive
        )
    })
}
