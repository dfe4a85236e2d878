//! The runner interface between the engine and storage backends.

use async_trait::async_trait;
use nql_proto::{Pagination, ParamRow, RowSet, SortSpec, Template};

use super::compiler::Part;
use super::context::ExecutionContext;
use crate::error::BackendError;

/// One part handed to a runner.
#[derive(Debug, Clone, Copy)]
pub struct RunRequest<'a> {
    /// The part to evaluate. All rules of the part share the runner's scope.
    pub part: &'a Part,
    /// Parameter rows (empty = unparameterized).
    pub params: &'a [ParamRow],
    /// Candidate templates for template references.
    pub templates: &'a [Template],
    /// Sort keys, most significant first.
    pub sort: &'a [SortSpec],
    /// Pagination, applied to each parameter row's result separately.
    pub pagination: Option<Pagination>,
    /// Batch `==` parameter rules into one `in` evaluation.
    pub coalesce: bool,
}

impl<'a> RunRequest<'a> {
    /// Create an unparameterized, unsorted request for a part.
    pub fn new(part: &'a Part) -> Self {
        Self {
            part,
            params: &[],
            templates: &[],
            sort: &[],
            pagination: None,
            coalesce: false,
        }
    }

    /// Set the parameter rows.
    pub fn with_params(mut self, params: &'a [ParamRow]) -> Self {
        self.params = params;
        self
    }

    /// Set the candidate templates.
    pub fn with_templates(mut self, templates: &'a [Template]) -> Self {
        self.templates = templates;
        self
    }

    /// Set the sort keys.
    pub fn with_sort(mut self, sort: &'a [SortSpec]) -> Self {
        self.sort = sort;
        self
    }

    /// Set pagination.
    pub fn with_pagination(mut self, pagination: Option<Pagination>) -> Self {
        self.pagination = pagination;
        self
    }

    /// Enable parameter coalescing.
    pub fn with_coalescing(mut self, coalesce: bool) -> Self {
        self.coalesce = coalesce;
        self
    }

    /// Number of row sets the runner must return.
    pub fn expected_sets(&self) -> usize {
        self.params.len().max(1)
    }
}

/// A storage backend able to evaluate parts in one scope.
///
/// Buckets whose runners report the same scope can be queried together in
/// one part; sub-queries into other scopes are split off by the compiler.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Opaque scope token.
    fn scope(&self) -> &str;

    /// Evaluate a part.
    ///
    /// Returns one [`RowSet`] per parameter row, in order, or a single row
    /// set when the request is unparameterized.
    async fn run(
        &self,
        ctx: &ExecutionContext,
        request: RunRequest<'_>,
    ) -> Result<Vec<RowSet>, BackendError>;
}
