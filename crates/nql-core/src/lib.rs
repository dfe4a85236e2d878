//! NQL core: query compilation and federated execution.
//!
//! Queries are JSON objects addressed to a bucket. The engine parses them
//! into rule trees, splits the trees into parts that a single storage
//! backend can evaluate, and runs those parts in dependency order, feeding
//! each part's output into the parts that reference it.
//!
//! ```ignore
//! let catalog = Arc::new(Catalog::new());
//! catalog.register(BucketDef::new("shape"), Arc::new(MemoryRunner::new("mem")));
//! let engine = QueryEngine::new(catalog);
//! let rows = engine.all(&ExecutionContext::new(), &request).await?;
//! ```

pub mod catalog;
pub mod config;
pub mod error;
pub mod query;

pub use query::memory;

pub use catalog::{BucketDef, Catalog, RegisteredBucket};
pub use config::{CompileLimits, EngineConfig};
pub use error::{BackendError, Error, StructuralError, StructuralErrorKind};
pub use query::{
    CompiledQuery, ExecutionContext, MemoryRunner, Part, QueryCompiler, QueryEngine, RunRequest,
    Runner,
};

/// Re-export protocol types.
pub use nql_proto as proto;
