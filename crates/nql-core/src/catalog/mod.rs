//! Bucket catalog.
//!
//! The catalog maps bucket names to their definitions and to the runner
//! that executes queries against them. The runner's scope token decides
//! which sub-queries can be evaluated together.

mod bucket;
mod catalog;

pub use bucket::BucketDef;
pub use catalog::{Catalog, RegisteredBucket};
