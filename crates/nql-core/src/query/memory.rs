//! In-memory runner.
//!
//! Stores objects per bucket and evaluates parts by scanning. Every bucket
//! held by one `MemoryRunner` shares its scope, so sub-queries between them
//! are evaluated inline.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use nql_proto::{distinct_values, get_path, identity_key, Pagination, Row, RowSet, SortSpec};
use parking_lot::RwLock;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, trace};

use super::ast::{RuleValue, Union};
use super::binder::ParamBinder;
use super::context::ExecutionContext;
use super::filter::{FilterEvaluator, UnboundRule};
use super::order::finish_rows;
use super::runner::{RunRequest, Runner};
use crate::error::BackendError;

/// Errors raised by the in-memory runner.
#[derive(Debug, Error)]
pub enum MemoryError {
    /// Object lacks a usable identity value.
    #[error("object in bucket '{bucket}' has no string or number '{field}' field")]
    MissingIdentity {
        /// Bucket the object was inserted into.
        bucket: String,
        /// Identity field name.
        field: String,
    },

    /// The runner holds no bucket of this name.
    #[error("bucket '{0}' is not held by this runner")]
    UnknownBucket(String),

    /// Inserted value is not a JSON object.
    #[error("cannot insert a non-object value into bucket '{0}'")]
    NotAnObject(String),

    /// A rule was left unbound.
    #[error(transparent)]
    Unbound(#[from] UnboundRule),
}

#[derive(Debug)]
struct MemoryBucket {
    identity_field: String,
    objects: BTreeMap<String, Value>,
}

impl MemoryBucket {
    fn new(identity_field: impl Into<String>) -> Self {
        Self {
            identity_field: identity_field.into(),
            objects: BTreeMap::new(),
        }
    }
}

/// A runner keeping buckets in memory.
#[derive(Debug)]
pub struct MemoryRunner {
    scope: String,
    buckets: RwLock<HashMap<String, MemoryBucket>>,
}

impl MemoryRunner {
    /// Create an empty runner reporting `scope`.
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            buckets: RwLock::new(HashMap::new()),
        }
    }

    /// Create a bucket with a custom identity field. Existing objects are kept.
    pub fn create_bucket(&self, bucket: &str, identity_field: &str) {
        let mut buckets = self.buckets.write();
        match buckets.get_mut(bucket) {
            Some(existing) => existing.identity_field = identity_field.to_string(),
            None => {
                buckets.insert(bucket.to_string(), MemoryBucket::new(identity_field));
            }
        }
    }

    /// Insert or replace an object, keyed by its identity field.
    ///
    /// Buckets not created explicitly use `id` as the identity field.
    pub fn insert(&self, bucket: &str, object: Value) -> Result<(), MemoryError> {
        if !object.is_object() {
            return Err(MemoryError::NotAnObject(bucket.to_string()));
        }
        let mut buckets = self.buckets.write();
        let entry = buckets
            .entry(bucket.to_string())
            .or_insert_with(|| MemoryBucket::new("id"));

        let key = get_path(&object, &entry.identity_field)
            .and_then(identity_key)
            .ok_or_else(|| MemoryError::MissingIdentity {
                bucket: bucket.to_string(),
                field: entry.identity_field.clone(),
            })?;
        entry.objects.insert(key, object);
        Ok(())
    }

    /// Insert many objects.
    pub fn extend(
        &self,
        bucket: &str,
        objects: impl IntoIterator<Item = Value>,
    ) -> Result<(), MemoryError> {
        for object in objects {
            self.insert(bucket, object)?;
        }
        Ok(())
    }

    /// Get an object by identity value.
    pub fn get(&self, bucket: &str, id: &Value) -> Option<Value> {
        let key = identity_key(id)?;
        self.buckets.read().get(bucket)?.objects.get(&key).cloned()
    }

    /// Remove an object by identity value.
    pub fn remove(&self, bucket: &str, id: &Value) -> Option<Value> {
        let key = identity_key(id)?;
        self.buckets.write().get_mut(bucket)?.objects.remove(&key)
    }

    /// Remove every object from a bucket.
    pub fn clear_bucket(&self, bucket: &str) {
        if let Some(entry) = self.buckets.write().get_mut(bucket) {
            entry.objects.clear();
        }
    }

    /// Number of objects in a bucket.
    pub fn len(&self, bucket: &str) -> usize {
        self.buckets
            .read()
            .get(bucket)
            .map(|b| b.objects.len())
            .unwrap_or(0)
    }

    /// Check if a bucket has no objects.
    pub fn is_empty(&self, bucket: &str) -> bool {
        self.len(bucket) == 0
    }

    /// Evaluate a bound rule tree directly, bypassing the engine.
    pub fn query(
        &self,
        union: &Union,
        sort: &[SortSpec],
        pagination: Option<Pagination>,
    ) -> Result<RowSet, MemoryError> {
        let rows = self.scan(union)?;
        Ok(finish_rows(rows, sort, pagination))
    }

    /// Rows of `union`'s bucket matching it, in identity order.
    ///
    /// Buckets never created on this runner are an error, including the
    /// buckets of inline sub-queries.
    fn scan(&self, union: &Union) -> Result<Vec<Row>, MemoryError> {
        let resolved = self.resolve_sub_queries(union)?;
        let buckets = self.buckets.read();
        let bucket = buckets
            .get(resolved.bucket())
            .ok_or_else(|| MemoryError::UnknownBucket(resolved.bucket().to_string()))?;

        let mut rows = Vec::new();
        for object in bucket.objects.values() {
            if FilterEvaluator::evaluate(&resolved, object)? {
                rows.push(object.clone());
            }
        }
        trace!(bucket = %resolved.bucket(), matched = rows.len(), "Scanned bucket");
        Ok(rows)
    }

    /// Replace inline sub-queries with the values they produce.
    fn resolve_sub_queries(&self, union: &Union) -> Result<Union, MemoryError> {
        let mut resolved = union.clone();
        let mut failure = None;
        resolved.visit_rules_mut(&mut |rule| {
            if failure.is_some() {
                return;
            }
            let RuleValue::SubQuery(sub) = &rule.value else {
                return;
            };
            match self.scan(&sub.union) {
                Ok(rows) => {
                    let values = distinct_values(&rows, &sub.field);
                    rule.value = RuleValue::Values(values);
                }
                Err(e) => failure = Some(e),
            }
        });
        match failure {
            Some(e) => Err(e),
            None => Ok(resolved),
        }
    }

    fn evaluate(&self, request: &RunRequest<'_>) -> Result<Vec<RowSet>, MemoryError> {
        let part = request.part;
        let binder = ParamBinder::new(request.params, request.templates)
            .with_coalescing(request.coalesce);

        if request.params.is_empty() {
            let union = if part.union.has_param_refs() {
                binder.bind(&part.union, &Value::Null, request.templates.first())
            } else {
                part.union.clone()
            };
            let rows = self.scan(&union)?;
            return Ok(vec![finish_rows(rows, request.sort, request.pagination)]);
        }

        let plan = binder.plan(&part.union);
        let mut per_row: Vec<Vec<Row>> = vec![Vec::new(); request.params.len()];

        for call in &plan.calls {
            let rows = self.scan(&call.union)?;
            match &call.fanout {
                Some(fanout) => {
                    for row in rows {
                        for target in fanout.matching_rows(&row) {
                            per_row[target].push(row.clone());
                        }
                    }
                }
                None => {
                    for &target in &call.rows {
                        per_row[target] = rows.clone();
                    }
                }
            }
        }

        debug!(
            bucket = %part.bucket(),
            rows = request.params.len(),
            calls = plan.calls.len(),
            excluded = plan.excluded.len(),
            "Evaluated parameterized part"
        );

        Ok(per_row
            .into_iter()
            .map(|rows| finish_rows(rows, request.sort, request.pagination))
            .collect())
    }
}

#[async_trait]
impl Runner for MemoryRunner {
    fn scope(&self) -> &str {
        &self.scope
    }

    async fn run(
        &self,
        _ctx: &ExecutionContext,
        request: RunRequest<'_>,
    ) -> Result<Vec<RowSet>, BackendError> {
        self.evaluate(&request).map_err(Into::into)
    }
}
