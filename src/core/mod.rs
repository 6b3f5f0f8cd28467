//! # Core Module
//!
//! The chain execution engine.
//!
//! ## Modules
//! - `context` - per-file key/value store passed between stages
//! - `record` - read-only input file handles
//! - `stage` - the stage contract and the name → factory registry
//! - `stages` - built-in stages
//! - `resources` - shared reference datasets (DEMs, masks)
//! - `finder` - input file selection
//! - `pipeline` - per-file runner, worker pool, orchestrator

pub mod context;
pub mod finder;
pub mod pipeline;
pub mod record;
pub mod resources;
pub mod stage;
pub mod stages;

// Re-export commonly used types
pub use context::Context;
pub use pipeline::{ChainResult, Orchestrator, RunSummary};
pub use record::{FileTask, Record, RecordReader};
pub use stage::{Outcome, Stage, StageRegistry};
