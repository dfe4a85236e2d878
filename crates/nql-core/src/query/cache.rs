//! Plan cache for compiled queries.
//!
//! Compiling a query walks the whole query object and consults the catalog
//! for every sub-query. This module caches compiled plans keyed by the
//! query text so repeated queries skip that work.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use nql_proto::Query;
use parking_lot::RwLock;
use tracing::trace;

use super::compiler::CompiledQuery;

/// Query fingerprint for cache lookup.
///
/// Compiled plans embed literal values, so the fingerprint covers the full
/// query text in key order, not just its shape.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct QueryFingerprint {
    bucket: String,
    canonical: String,
}

impl QueryFingerprint {
    /// Create a fingerprint for a query on `bucket`.
    pub fn from_query(bucket: &str, query: &Query) -> Self {
        Self {
            bucket: bucket.to_string(),
            canonical: query.to_value().to_string(),
        }
    }

    /// The bucket the query selects from.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

/// Cached plan with metadata.
#[derive(Debug)]
pub struct CachedPlan {
    /// The compiled query.
    pub plan: Arc<CompiledQuery>,
    /// Catalog version the plan was compiled against.
    pub catalog_version: u64,
    /// Number of cache hits for this plan.
    pub hit_count: AtomicU64,
}

impl CachedPlan {
    /// Create a new cached plan.
    pub fn new(plan: Arc<CompiledQuery>, catalog_version: u64) -> Self {
        Self {
            plan,
            catalog_version,
            hit_count: AtomicU64::new(0),
        }
    }

    /// Increment the hit count and return the new value.
    pub fn record_hit(&self) -> u64 {
        self.hit_count.fetch_add(1, AtomicOrdering::Relaxed) + 1
    }

    /// Get the current hit count.
    pub fn hits(&self) -> u64 {
        self.hit_count.load(AtomicOrdering::Relaxed)
    }
}

/// Cache statistics.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl CacheStats {
    /// Get hit count.
    pub fn hits(&self) -> u64 {
        self.hits.load(AtomicOrdering::Relaxed)
    }

    /// Get miss count.
    pub fn misses(&self) -> u64 {
        self.misses.load(AtomicOrdering::Relaxed)
    }

    /// Get eviction count.
    pub fn evictions(&self) -> u64 {
        self.evictions.load(AtomicOrdering::Relaxed)
    }

    /// Calculate hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total > 0.0 {
            hits / total
        } else {
            0.0
        }
    }
}

/// Plan cache with least-used eviction.
///
/// Plans compiled against an older catalog version are treated as misses
/// and replaced on the next insert. A cache with zero capacity stores
/// nothing.
pub struct PlanCache {
    cache: RwLock<HashMap<QueryFingerprint, CachedPlan>>,
    max_entries: usize,
    stats: CacheStats,
}

impl PlanCache {
    /// Create a new plan cache with the specified maximum size.
    pub fn new(max_entries: usize) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            max_entries,
            stats: CacheStats::default(),
        }
    }

    /// Check if the cache stores anything at all.
    pub fn is_enabled(&self) -> bool {
        self.max_entries > 0
    }

    /// Get a cached plan compiled against `catalog_version`.
    pub fn get(
        &self,
        fingerprint: &QueryFingerprint,
        catalog_version: u64,
    ) -> Option<Arc<CompiledQuery>> {
        if !self.is_enabled() {
            return None;
        }

        let guard = self.cache.read();
        if let Some(cached) = guard.get(fingerprint) {
            if cached.catalog_version == catalog_version {
                let hits = cached.record_hit();
                self.stats.hits.fetch_add(1, AtomicOrdering::Relaxed);
                trace!(bucket = %fingerprint.bucket, hits, "Plan cache hit");
                return Some(cached.plan.clone());
            }
        }

        self.stats.misses.fetch_add(1, AtomicOrdering::Relaxed);
        None
    }

    /// Insert a plan into the cache.
    ///
    /// If the cache is full, stale plans are dropped first, then the
    /// least-used entry is evicted.
    pub fn insert(
        &self,
        fingerprint: QueryFingerprint,
        plan: Arc<CompiledQuery>,
        catalog_version: u64,
    ) {
        if !self.is_enabled() {
            return;
        }

        let mut guard = self.cache.write();
        if guard.len() >= self.max_entries && !guard.contains_key(&fingerprint) {
            let before = guard.len();
            guard.retain(|_, cached| cached.catalog_version == catalog_version);
            let dropped = (before - guard.len()) as u64;
            self.stats.evictions.fetch_add(dropped, AtomicOrdering::Relaxed);

            if guard.len() >= self.max_entries {
                self.evict_least_used(&mut guard);
            }
        }

        guard.insert(fingerprint, CachedPlan::new(plan, catalog_version));
    }

    fn evict_least_used(&self, cache: &mut HashMap<QueryFingerprint, CachedPlan>) {
        let evict_key = cache
            .iter()
            .min_by_key(|(_, v)| v.hits())
            .map(|(k, _)| k.clone());

        if let Some(key) = evict_key {
            cache.remove(&key);
            self.stats.evictions.fetch_add(1, AtomicOrdering::Relaxed);
        }
    }

    /// Get cache statistics.
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Get the current number of cached entries.
    pub fn len(&self) -> usize {
        self.cache.read().len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clear all cached entries.
    pub fn clear(&self) {
        self.cache.write().clear();
    }
}
