//! Query compilation and execution.
//!
//! A query object is parsed into a rule tree, split into parts by runner
//! scope, and executed part by part through the runners registered in the
//! catalog.

mod ast;
mod binder;
mod builder;
mod cache;
mod compiler;
mod context;
mod executor;
mod filter;
pub mod memory;
mod order;
mod runner;

pub use ast::{
    Intersection, Member, Op, ParamRef, PartRef, Rule, RuleValue, SubQuery, TemplateRef, Union,
    UnionMeta,
};
pub use binder::{BindPlan, BoundCall, Fanout, ParamBinder, TemplateGroup};
pub use builder::RuleTreeBuilder;
pub use cache::{CacheStats, CachedPlan, PlanCache, QueryFingerprint};
pub use compiler::{execution_order, CompiledQuery, Part, QueryCompiler};
pub use context::ExecutionContext;
pub use executor::QueryEngine;
pub use filter::{FilterEvaluator, UnboundRule};
pub use memory::{MemoryError, MemoryRunner};
pub use order::{compare_values_opt, finish_rows, paginate, sort_rows};
pub use runner::{RunRequest, Runner};
