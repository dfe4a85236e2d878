//! Query engine: compiles queries and executes their parts.
//!
//! Parts run strictly in execution order. Before a part runs, every
//! reference to another part's output is replaced with the distinct values
//! of the referenced field. In a parameterized execution, part outputs are
//! tracked per parameter row, and rows whose dependencies produced the same
//! values share one runner call.

use std::collections::HashMap;
use std::sync::Arc;

use nql_proto::{
    distinct_values, Page, Pagination, ParamRow, Query, QueryRequest, Row, RowSet, SortSpec,
};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use super::ast::RuleValue;
use super::cache::{CacheStats, PlanCache, QueryFingerprint};
use super::compiler::{CompiledQuery, Part, QueryCompiler};
use super::context::ExecutionContext;
use super::runner::RunRequest;
use crate::catalog::{Catalog, RegisteredBucket};
use crate::config::EngineConfig;
use crate::error::{BackendError, Error, StructuralError, StructuralErrorKind};

/// Output of each part, indexed by part id, one row set per parameter row.
type PartOutputs = Vec<Option<Vec<RowSet>>>;

/// Compiles and executes queries against the buckets of a catalog.
pub struct QueryEngine {
    catalog: Arc<Catalog>,
    config: EngineConfig,
    cache: PlanCache,
}

impl QueryEngine {
    /// Create an engine with the default configuration.
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self::with_config(catalog, EngineConfig::default())
    }

    /// Create an engine with a custom configuration.
    pub fn with_config(catalog: Arc<Catalog>, config: EngineConfig) -> Self {
        let cache = PlanCache::new(config.plan_cache_capacity);
        Self {
            catalog,
            config,
            cache,
        }
    }

    /// The catalog queries are compiled against.
    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    /// The engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Plan cache statistics.
    pub fn cache_stats(&self) -> &CacheStats {
        self.cache.stats()
    }

    /// Compile a query on `bucket`, reusing a cached plan when possible.
    pub fn compile(&self, bucket: &str, query: &Query) -> Result<Arc<CompiledQuery>, Error> {
        let version = self.catalog.current_version();
        let fingerprint = QueryFingerprint::from_query(bucket, query);
        if let Some(plan) = self.cache.get(&fingerprint, version) {
            return Ok(plan);
        }

        let compiled = QueryCompiler::new(&self.catalog, &self.config.limits)
            .compile(bucket, query.as_map())?;
        let compiled = Arc::new(compiled);
        self.cache.insert(fingerprint, compiled.clone(), version);
        Ok(compiled)
    }

    /// Describe how a query would be executed.
    pub fn explain(&self, bucket: &str, query: &Query) -> Result<String, Error> {
        Ok(self.compile(bucket, query)?.explain())
    }

    /// Execute a request.
    ///
    /// Returns one row set per parameter row, or a single row set when the
    /// request is unparameterized.
    #[instrument(skip_all, fields(bucket = %request.bucket, ctx = %ctx.label()))]
    pub async fn execute(
        &self,
        ctx: &ExecutionContext,
        request: &QueryRequest,
    ) -> Result<Vec<RowSet>, Error> {
        if let Some(pagination) = &request.pagination {
            pagination.validate()?;
        }
        let compiled = self.compile(&request.bucket, &request.query)?;
        self.execute_compiled(ctx, &compiled, request).await
    }

    /// Execute a request and flatten every row set into one list.
    pub async fn all(
        &self,
        ctx: &ExecutionContext,
        request: &QueryRequest,
    ) -> Result<Vec<Row>, Error> {
        let sets = self.execute(ctx, request).await?;
        Ok(sets.into_iter().flat_map(|set| set.rows).collect())
    }

    /// Execute a request and return a page.
    ///
    /// For a parameterized request the pages of every row are concatenated
    /// and their totals summed.
    pub async fn page(&self, ctx: &ExecutionContext, request: &QueryRequest) -> Result<Page, Error> {
        let pagination = request.pagination.unwrap_or_else(Pagination::all);
        let sets = self.execute(ctx, request).await?;
        let merged = sets.into_iter().fold(RowSet::empty(), |mut acc, set| {
            acc.rows.extend(set.rows);
            acc.total += set.total;
            acc
        });
        Ok(Page::from_row_set(merged, pagination))
    }

    /// Execute an already compiled query.
    #[instrument(skip_all, fields(bucket = %compiled.bucket, parts = compiled.len(), ctx = %ctx.label()))]
    pub async fn execute_compiled(
        &self,
        ctx: &ExecutionContext,
        compiled: &CompiledQuery,
        request: &QueryRequest,
    ) -> Result<Vec<RowSet>, Error> {
        if compiled.has_param_refs() && request.params.is_empty() {
            return Err(StructuralError::new(
                StructuralErrorKind::MissingParams,
                format!(
                    "query on '{}' references parameters but none were supplied",
                    compiled.bucket
                ),
            )
            .into());
        }

        let mut outputs: PartOutputs = vec![None; compiled.len()];
        for &id in &compiled.exec_order {
            if ctx.is_cancelled() {
                warn!(part = id, "Execution cancelled");
                return Err(Error::Cancelled);
            }

            let part = compiled.part(id).ok_or_else(|| Error::UnresolvedScope {
                part: id,
                bucket: compiled.bucket.clone(),
                detail: "no such part".to_string(),
            })?;
            let bucket = self
                .catalog
                .get(part.bucket())
                .ok_or_else(|| StructuralError::unknown_bucket(part.bucket()))?;
            compiled.check_part(id, bucket.scope())?;

            let sets = self.run_part(ctx, part, &bucket, &outputs, request).await?;
            debug!(
                part = id,
                bucket = %part.bucket(),
                scope = %part.scope(),
                sets = sets.len(),
                rows = sets.iter().map(RowSet::len).sum::<usize>(),
                "Executed part"
            );
            outputs[id] = Some(sets);
        }

        outputs
            .first_mut()
            .and_then(Option::take)
            .ok_or_else(|| Error::UnresolvedScope {
                part: 0,
                bucket: compiled.bucket.clone(),
                detail: "root part produced no output".to_string(),
            })
    }

    async fn run_part(
        &self,
        ctx: &ExecutionContext,
        part: &Part,
        bucket: &RegisteredBucket,
        outputs: &PartOutputs,
        request: &QueryRequest,
    ) -> Result<Vec<RowSet>, Error> {
        let all_rows: Vec<usize> = (0..request.params.len()).collect();
        if part.depends_on.is_empty() {
            return self.run_rows(ctx, part, bucket, request, &all_rows).await;
        }

        // Group rows by the dependency values they see.
        let slots = request.params.len().max(1);
        let mut groups: Vec<(Part, Vec<usize>)> = Vec::new();
        let mut seen: HashMap<String, usize> = HashMap::new();
        for slot in 0..slots {
            let (resolved, key) = substitute_part_refs(part, outputs, slot)?;
            match seen.get(&key) {
                Some(&group) => groups[group].1.push(slot),
                None => {
                    seen.insert(key, groups.len());
                    groups.push((resolved, vec![slot]));
                }
            }
        }

        if request.params.is_empty() {
            let Some((resolved, _)) = groups.into_iter().next() else {
                return Ok(vec![RowSet::empty()]);
            };
            return self.run_rows(ctx, &resolved, bucket, request, &[]).await;
        }

        let mut result = vec![RowSet::empty(); request.params.len()];
        for (resolved, rows) in groups {
            let sets = self.run_rows(ctx, &resolved, bucket, request, &rows).await?;
            for (row, set) in rows.into_iter().zip(sets) {
                result[row] = set;
            }
        }
        Ok(result)
    }

    /// Run a part for a subset of parameter rows. Returns one row set per
    /// row, or a single row set when the request is unparameterized.
    async fn run_rows(
        &self,
        ctx: &ExecutionContext,
        part: &Part,
        bucket: &RegisteredBucket,
        request: &QueryRequest,
        rows: &[usize],
    ) -> Result<Vec<RowSet>, Error> {
        if request.params.is_empty() {
            return self.invoke(ctx, part, bucket, request, &[]).await;
        }

        if !part.has_param_refs() {
            let sets = self.invoke(ctx, part, bucket, request, &[]).await?;
            let set = sets.into_iter().next().unwrap_or_default();
            return Ok(vec![set; rows.len()]);
        }

        if rows.len() == request.params.len() {
            return self.invoke(ctx, part, bucket, request, &request.params).await;
        }
        let params: Vec<ParamRow> = rows.iter().map(|&r| request.params[r].clone()).collect();
        self.invoke(ctx, part, bucket, request, &params).await
    }

    async fn invoke(
        &self,
        ctx: &ExecutionContext,
        part: &Part,
        bucket: &RegisteredBucket,
        request: &QueryRequest,
        params: &[ParamRow],
    ) -> Result<Vec<RowSet>, Error> {
        let root = part.id == 0;
        let sort: &[SortSpec] = if root { &request.sort } else { &[] };
        let pagination = if root { request.pagination } else { None };

        let run = RunRequest::new(part)
            .with_params(params)
            .with_templates(&request.templates)
            .with_sort(sort)
            .with_pagination(pagination)
            .with_coalescing(self.config.coalesce_params);
        let expected = run.expected_sets();

        let backend = |source: BackendError| Error::Backend {
            bucket: part.bucket().to_string(),
            scope: bucket.scope().to_string(),
            source,
        };

        let result = tokio::select! {
            biased;
            _ = ctx.cancelled() => {
                warn!(part = part.id, bucket = %part.bucket(), "Execution cancelled");
                return Err(Error::Cancelled);
            }
            result = bucket.runner.run(ctx, run) => result,
        };

        let sets = result.map_err(|source| {
            warn!(
                part = part.id,
                bucket = %part.bucket(),
                scope = %bucket.scope(),
                error = %source,
                "Runner failed"
            );
            backend(source)
        })?;

        if sets.len() != expected {
            return Err(backend(
                format!(
                    "runner returned {} row sets, expected {}",
                    sets.len(),
                    expected
                )
                .into(),
            ));
        }
        Ok(sets)
    }
}

/// Replace part references with the values the referenced parts produced
/// for parameter row `slot`.
///
/// Returns the resolved part and a key identifying the substituted values.
fn substitute_part_refs(
    part: &Part,
    outputs: &PartOutputs,
    slot: usize,
) -> Result<(Part, String), Error> {
    let mut resolved = part.clone();
    let mut substituted = Vec::new();
    let mut missing = None;

    resolved.union.visit_rules_mut(&mut |rule| {
        let RuleValue::Part(reference) = &rule.value else {
            return;
        };
        let set = outputs
            .get(reference.part)
            .and_then(Option::as_ref)
            .and_then(|sets| sets.get(slot));
        match set {
            Some(set) => {
                let values = distinct_values(&set.rows, &reference.field);
                substituted.push(Value::Array(values.clone()));
                rule.value = RuleValue::Values(values);
            }
            None => missing = Some(reference.part),
        }
    });

    if let Some(dependency) = missing {
        return Err(Error::UnresolvedScope {
            part: part.id,
            bucket: part.bucket().to_string(),
            detail: format!("part {} has not produced output", dependency),
        });
    }
    Ok((resolved, Value::Array(substituted).to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::BucketDef;
    use crate::query::{MemoryRunner, Runner};
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    struct FailingRunner;

    #[async_trait]
    impl Runner for FailingRunner {
        fn scope(&self) -> &str {
            "broken"
        }

        async fn run(
            &self,
            _ctx: &ExecutionContext,
            _request: RunRequest<'_>,
        ) -> Result<Vec<RowSet>, BackendError> {
            Err("connection refused".into())
        }
    }

    struct SlowRunner;

    #[async_trait]
    impl Runner for SlowRunner {
        fn scope(&self) -> &str {
            "slow"
        }

        async fn run(
            &self,
            _ctx: &ExecutionContext,
            _request: RunRequest<'_>,
        ) -> Result<Vec<RowSet>, BackendError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(vec![RowSet::empty()])
        }
    }

    struct ShortRunner;

    #[async_trait]
    impl Runner for ShortRunner {
        fn scope(&self) -> &str {
            "short"
        }

        async fn run(
            &self,
            _ctx: &ExecutionContext,
            _request: RunRequest<'_>,
        ) -> Result<Vec<RowSet>, BackendError> {
            Ok(vec![])
        }
    }

    fn engine() -> QueryEngine {
        let catalog = Arc::new(Catalog::new());
        let memory = Arc::new(MemoryRunner::new("mem"));
        memory
            .extend(
                "shape",
                vec![
                    json!({"id": 1, "size": 11, "color_id": 1}),
                    json!({"id": 2, "size": 22, "color_id": 2}),
                ],
            )
            .unwrap();
        catalog.register(BucketDef::new("shape"), memory);
        catalog.register(BucketDef::new("broken"), Arc::new(FailingRunner));
        catalog.register(BucketDef::new("slow"), Arc::new(SlowRunner));
        catalog.register(BucketDef::new("short"), Arc::new(ShortRunner));
        QueryEngine::new(catalog)
    }

    fn request(bucket: &str, query: Value) -> QueryRequest {
        QueryRequest::new(bucket, Query::from_value(query).unwrap())
    }

    #[tokio::test]
    async fn test_backend_error_is_wrapped() {
        let engine = engine();
        let err = engine
            .execute(&ExecutionContext::new(), &request("broken", json!({})))
            .await
            .unwrap_err();

        match err {
            Error::Backend { bucket, scope, source } => {
                assert_eq!(bucket, "broken");
                assert_eq!(scope, "broken");
                assert_eq!(source.to_string(), "connection refused");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_failing_dependency_aborts_execution() {
        let engine = engine();
        let err = engine
            .execute(
                &ExecutionContext::new(),
                &request("shape", json!({"color_id": {"@broken.id": {}}})),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Backend { ref bucket, .. } if bucket == "broken"));
    }

    #[tokio::test]
    async fn test_same_scope_on_separate_runners_is_a_backend_error() {
        let catalog = Arc::new(Catalog::new());
        let shapes = Arc::new(MemoryRunner::new("mem"));
        shapes
            .extend("shape", vec![json!({"id": 1, "color_id": 1})])
            .unwrap();
        let colors = Arc::new(MemoryRunner::new("mem"));
        colors.extend("color", vec![json!({"id": 1})]).unwrap();
        catalog.register(BucketDef::new("shape"), shapes);
        catalog.register(BucketDef::new("color"), colors);
        let engine = QueryEngine::new(catalog);

        let err = engine
            .execute(
                &ExecutionContext::new(),
                &request("shape", json!({"color_id in": {"@color.id": {}}})),
            )
            .await
            .unwrap_err();
        match err {
            Error::Backend { bucket, scope, source } => {
                assert_eq!(bucket, "shape");
                assert_eq!(scope, "mem");
                assert_eq!(source.to_string(), "bucket 'color' is not held by this runner");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_wrong_row_set_count_is_a_backend_error() {
        let engine = engine();
        let err = engine
            .execute(&ExecutionContext::new(), &request("short", json!({})))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("runner returned 0 row sets, expected 1"));
    }

    #[tokio::test]
    async fn test_cancellation_aborts_in_flight_call() {
        let engine = engine();
        let ctx = ExecutionContext::new().with_label("cancel-test");
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let err = tokio::time::timeout(
            Duration::from_secs(5),
            engine.execute(&ctx, &request("slow", json!({}))),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test]
    async fn test_cancelled_context_runs_nothing() {
        let engine = engine();
        let ctx = ExecutionContext::new();
        ctx.cancel();
        let err = engine
            .execute(&ctx, &request("shape", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test]
    async fn test_missing_params() {
        let engine = engine();
        let err = engine
            .execute(
                &ExecutionContext::new(),
                &request("shape", json!({"id": {".": "shape_id"}})),
            )
            .await
            .unwrap_err();
        assert_eq!(err.structural_kind(), Some(StructuralErrorKind::MissingParams));
    }

    #[tokio::test]
    async fn test_invalid_pagination() {
        let engine = engine();
        let req = request("shape", json!({})).with_pagination(Pagination::new(-5, 0));
        let err = engine.execute(&ExecutionContext::new(), &req).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_compile_uses_plan_cache() {
        let engine = engine();
        let query = Query::from_value(json!({"size >": 1})).unwrap();

        let first = engine.compile("shape", &query).unwrap();
        let second = engine.compile("shape", &query).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(engine.cache_stats().hits(), 1);

        engine
            .catalog()
            .register(BucketDef::new("color"), Arc::new(MemoryRunner::new("mem")));
        let third = engine.compile("shape", &query).unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
    }

    #[test]
    fn test_disabled_plan_cache() {
        let catalog = Arc::new(Catalog::new());
        catalog.register(BucketDef::new("shape"), Arc::new(MemoryRunner::new("mem")));
        let engine = QueryEngine::with_config(catalog, EngineConfig::new().without_plan_cache());
        let query = Query::new();

        let first = engine.compile("shape", &query).unwrap();
        let second = engine.compile("shape", &query).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(engine.cache_stats().hits(), 0);
    }

    #[test]
    fn test_explain() {
        let engine = engine();
        let explain = engine
            .explain("shape", &Query::from_value(json!({"size >": 11})).unwrap())
            .unwrap();
        assert!(explain.contains("part 0 [shape @ mem]"));
        assert!(explain.contains("size > 11"));
    }
}
