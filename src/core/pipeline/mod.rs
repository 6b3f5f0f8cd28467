//! # Pipeline Module
//!
//! Runs a chain of stages over a list of files.
//!
//! ## Pieces
//! - `PipelineRunner` - drives one file through every stage in order
//! - `WorkerPool` - dispatches files, either in-process in list order or
//!   across worker processes
//! - `worker` - the child side of the worker protocol
//! - `ChainResult` - counters and per-file reports merged in the parent
//! - `Orchestrator` - ties it all together: build, initialize, run, finalize
//!
//! ## Example
//! ```rust,ignore
//! let config = RunConfig::load(Path::new("chain.toml"))?;
//! let files = L1bFinder::from_settings(&config.finder)?.select()?;
//!
//! let result = Orchestrator::builder(config).build()?.run(files)?;
//! println!("{} processed, {} errors", result.files_processed, result.errors);
//! ```

mod logs;
mod orchestrator;
mod pool;
mod result;
mod runner;
pub mod worker;

pub use logs::{merge_worker_logs, replay_log};
pub use orchestrator::{Orchestrator, OrchestratorBuilder};
pub use pool::{partition, ExecutionMode, PoolRun, WorkerPool};
pub use result::{ChainResult, RunSummary, StageTiming};
pub use runner::{FileReport, FileState, PipelineRunner};

use crate::config::RunConfig;
use crate::core::resources::SharedResourceCache;
use crate::core::stage::{Stage, StageInit};
use crate::error::StageError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative stop flag shared between the dispatcher and its callers
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the run to stop dispatching files
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Call `initialize` on every stage in order. The first error aborts.
pub fn initialize_stages(
    stages: &mut [Box<dyn Stage>],
    config: &RunConfig,
    resources: &SharedResourceCache,
) -> Result<(), StageError> {
    for stage in stages.iter_mut() {
        let name = stage.name().to_string();
        stage.initialize(&StageInit::new(&name, config, resources))?;
        tracing::debug!(stage = %name, "Initialized stage");
    }
    Ok(())
}
