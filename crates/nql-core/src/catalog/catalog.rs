//! Registry of buckets and the runners that serve them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use super::BucketDef;
use crate::query::Runner;

/// A bucket definition together with its runner.
#[derive(Clone)]
pub struct RegisteredBucket {
    /// The bucket definition.
    pub def: BucketDef,
    /// The runner serving the bucket.
    pub runner: Arc<dyn Runner>,
}

impl RegisteredBucket {
    /// Scope token of the bucket's runner.
    pub fn scope(&self) -> &str {
        self.runner.scope()
    }
}

impl std::fmt::Debug for RegisteredBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredBucket")
            .field("def", &self.def)
            .field("scope", &self.scope())
            .finish()
    }
}

/// The bucket catalog.
///
/// Every registration bumps the catalog version, which invalidates plans
/// compiled against an older catalog.
#[derive(Debug, Default)]
pub struct Catalog {
    buckets: DashMap<String, RegisteredBucket>,
    version: AtomicU64,
}

impl Catalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a bucket. Returns the new catalog version.
    pub fn register(&self, def: BucketDef, runner: Arc<dyn Runner>) -> u64 {
        debug!(bucket = %def.name, scope = runner.scope(), "Registering bucket");
        self.buckets
            .insert(def.name.clone(), RegisteredBucket { def, runner });
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Remove a bucket. Returns the removed registration.
    pub fn unregister(&self, name: &str) -> Option<RegisteredBucket> {
        let removed = self.buckets.remove(name).map(|(_, bucket)| bucket);
        if removed.is_some() {
            self.version.fetch_add(1, Ordering::SeqCst);
        }
        removed
    }

    /// Get a registered bucket by name.
    pub fn get(&self, name: &str) -> Option<RegisteredBucket> {
        self.buckets.get(name).map(|entry| entry.value().clone())
    }

    /// Get the scope token of a bucket's runner.
    pub fn scope_of(&self, name: &str) -> Option<String> {
        self.buckets
            .get(name)
            .map(|entry| entry.value().scope().to_string())
    }

    /// Check if a bucket is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.buckets.contains_key(name)
    }

    /// List registered bucket names, sorted.
    pub fn bucket_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.buckets.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Number of registered buckets.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Check if no buckets are registered.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Get the current catalog version.
    pub fn current_version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::MemoryRunner;

    #[test]
    fn test_register_and_lookup() {
        let catalog = Catalog::new();
        assert_eq!(catalog.current_version(), 0);

        let runner = Arc::new(MemoryRunner::new("db-a"));
        let v1 = catalog.register(BucketDef::new("shape"), runner.clone());
        let v2 = catalog.register(BucketDef::new("color"), runner);
        assert_eq!(v1, 1);
        assert_eq!(v2, 2);

        assert!(catalog.contains("shape"));
        assert_eq!(catalog.scope_of("color").as_deref(), Some("db-a"));
        assert_eq!(catalog.bucket_names(), vec!["color", "shape"]);
        assert!(catalog.get("tag").is_none());
    }

    #[test]
    fn test_replace_and_unregister_bump_version() {
        let catalog = Catalog::new();
        catalog.register(BucketDef::new("shape"), Arc::new(MemoryRunner::new("a")));
        catalog.register(BucketDef::new("shape"), Arc::new(MemoryRunner::new("b")));

        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.scope_of("shape").as_deref(), Some("b"));
        assert_eq!(catalog.current_version(), 2);

        assert!(catalog.unregister("shape").is_some());
        assert!(catalog.unregister("shape").is_none());
        assert_eq!(catalog.current_version(), 3);
        assert!(catalog.is_empty());
    }
}
