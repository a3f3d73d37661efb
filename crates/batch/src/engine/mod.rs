//! Batch execution engine
//!
//! The engine module provides the [`BatchProcessor`], which admits batch
//! calls, dispatches their items under a shared concurrency limit and
//! aggregates the outcomes.

mod admission;
mod item;
mod priority;
mod processor;
mod result;
mod scope;

pub use item::{ItemContext, ItemResult, ItemStatus};
pub use priority::PrioritizedItem;
pub use processor::BatchProcessor;
pub use result::BatchResult;
