//! Engine configuration.

use serde::{Deserialize, Serialize};

/// Default maximum sub-query nesting depth.
pub const DEFAULT_MAX_DEPTH: usize = 8;

/// Default maximum number of parts in one compiled query.
pub const DEFAULT_MAX_PARTS: usize = 64;

/// Default number of compiled plans kept in the plan cache.
pub const DEFAULT_PLAN_CACHE_CAPACITY: usize = 256;

/// Limits applied while compiling a query, to reject runaway queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompileLimits {
    /// Maximum sub-query nesting depth (the root query is depth 0).
    pub max_depth: usize,
    /// Maximum number of parts a query may be split into.
    pub max_parts: usize,
}

impl Default for CompileLimits {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            max_parts: DEFAULT_MAX_PARTS,
        }
    }
}

impl CompileLimits {
    /// Create limits with custom values.
    pub fn new(max_depth: usize, max_parts: usize) -> Self {
        Self {
            max_depth,
            max_parts,
        }
    }

    /// Create unlimited limits (use with caution).
    pub fn unlimited() -> Self {
        Self {
            max_depth: usize::MAX,
            max_parts: usize::MAX,
        }
    }
}

/// Configuration for the query engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Compile limits.
    pub limits: CompileLimits,

    /// Number of compiled plans to cache. Zero disables the cache.
    pub plan_cache_capacity: usize,

    /// Batch `==` parameter rules into a single `in` evaluation.
    pub coalesce_params: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            limits: CompileLimits::default(),
            plan_cache_capacity: DEFAULT_PLAN_CACHE_CAPACITY,
            coalesce_params: true,
        }
    }
}

impl EngineConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the compile limits.
    pub fn with_limits(mut self, limits: CompileLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Set the plan cache capacity.
    pub fn with_plan_cache_capacity(mut self, capacity: usize) -> Self {
        self.plan_cache_capacity = capacity;
        self
    }

    /// Disable the plan cache.
    pub fn without_plan_cache(mut self) -> Self {
        self.plan_cache_capacity = 0;
        self
    }

    /// Enable or disable parameter coalescing.
    pub fn coalesce_params(mut self, coalesce: bool) -> Self {
        self.coalesce_params = coalesce;
        self
    }
}
