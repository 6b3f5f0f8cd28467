//! Top-level run: build, initialize, dispatch, aggregate, finalize.

use super::logs::{merge_worker_logs, replay_log};
use super::pool::{ExecutionMode, WorkerPool};
use super::result::ChainResult;
use super::runner::{FileReport, PipelineRunner};
use super::{initialize_stages, CancellationToken};
use crate::config::RunConfig;
use crate::core::finder::FileSelector;
use crate::core::record::{FileTask, JsonRecordReader, RecordReader};
use crate::core::resources::{DatasetSource, GridFileSource, SharedMemoryBackend, SharedResourceCache};
use crate::core::stage::{Stage, StageDescriptor, StageRegistry};
use crate::error::{ChainError, ConfigError, WorkerError};
use crate::events::{null_sender, ChainEvent, Event, EventSender, FileEvent, FileProgress};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

/// Builder for an [`Orchestrator`]
pub struct OrchestratorBuilder {
    config: RunConfig,
    registry: Option<StageRegistry>,
    reader: Arc<dyn RecordReader>,
    source: Arc<dyn DatasetSource>,
    worker_program: Option<PathBuf>,
}

impl OrchestratorBuilder {
    pub fn new(config: RunConfig) -> Self {
        Self {
            config,
            registry: None,
            reader: Arc::new(JsonRecordReader),
            source: Arc::new(GridFileSource),
            worker_program: None,
        }
    }

    /// Stage registry used to build the chain (default: built-in stages).
    /// Worker processes always use the built-in registry.
    pub fn registry(mut self, registry: StageRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Record reader for sequential runs
    pub fn record_reader(mut self, reader: Arc<dyn RecordReader>) -> Self {
        self.reader = reader;
        self
    }

    /// Dataset source for the parent process
    pub fn dataset_source(mut self, source: Arc<dyn DatasetSource>) -> Self {
        self.source = source;
        self
    }

    /// Executable started for each worker (default: the current executable)
    pub fn worker_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.worker_program = Some(program.into());
        self
    }

    /// Build the stage chain and check its key schema
    pub fn build(self) -> Result<Orchestrator, ChainError> {
        self.config.validate()?;
        let registry = self
            .registry
            .unwrap_or_else(|| StageRegistry::global().clone());
        let stages = registry.build_chain(&self.config.chain.stages)?;

        if self.config.chain.use_multi_processing {
            let builtin = StageRegistry::global();
            if let Some(name) = self
                .config
                .chain
                .stages
                .iter()
                .find(|name| !builtin.contains(name))
            {
                return Err(ConfigError::Invalid(format!(
                    "stage '{name}' is not built in; worker processes can only run built-in stages"
                ))
                .into());
            }
        }

        Ok(Orchestrator {
            config: self.config,
            stages,
            reader: self.reader,
            source: self.source,
            worker_program: self.worker_program,
            cancel: CancellationToken::new(),
        })
    }
}

/// Runs a configured chain over a list of files
pub struct Orchestrator {
    config: RunConfig,
    stages: Vec<Box<dyn Stage>>,
    reader: Arc<dyn RecordReader>,
    source: Arc<dyn DatasetSource>,
    worker_program: Option<PathBuf>,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn builder(config: RunConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// The chain's stages in execution order
    pub fn stages(&self) -> Vec<StageDescriptor> {
        StageDescriptor::list(&self.config.chain.stages)
    }

    /// Token that stops dispatch of further files when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Ask a file selector for the input list
    pub fn select_files(&self, selector: &dyn FileSelector) -> Result<Vec<PathBuf>, ChainError> {
        Ok(selector.select()?)
    }

    /// Run without progress reporting
    pub fn run(self, files: Vec<PathBuf>) -> Result<ChainResult, ChainError> {
        self.run_with_events(files, &null_sender())
    }

    /// Run, emitting progress events.
    ///
    /// An `Err` means the run never started (a stage could not initialize,
    /// a dataset could not be published, a worker could not be spawned).
    pub fn run_with_events(
        mut self,
        files: Vec<PathBuf>,
        events: &EventSender,
    ) -> Result<ChainResult, ChainError> {
        let started = Instant::now();
        let chain = self.config.chain.clone();
        let mode = if chain.use_multi_processing {
            ExecutionMode::Processes {
                workers: chain.worker_limit().min(files.len()).max(1),
            }
        } else {
            ExecutionMode::Sequential
        };
        let shared = matches!(mode, ExecutionMode::Processes { .. }) && chain.use_shared_memory;
        if shared {
            self.config.shared_memory.namespace = Some(uuid::Uuid::new_v4().simple().to_string());
        }

        let cache = SharedResourceCache::from_config(&self.config, Arc::clone(&self.source), shared)?;
        if let Err(e) = initialize_stages(&mut self.stages, &self.config, &cache) {
            error!(error = %e, "Chain initialization failed");
            self.release(&cache);
            events.send(Event::Chain(ChainEvent::Error {
                message: e.to_string(),
            }));
            return Err(e.into());
        }

        if chain.stop_on_error {
            warn!("stop_on_error is set: the chain stops dispatching at the first failed file");
        }
        let workers = match mode {
            ExecutionMode::Processes { workers } => workers,
            ExecutionMode::Sequential => 0,
        };
        info!(chain = %chain.name, files = files.len(), workers, "Starting chain");
        events.send(Event::Chain(ChainEvent::Started {
            name: chain.name.clone(),
            stages: chain.stages.clone(),
            total_files: files.len(),
            workers,
        }));

        let tasks = FileTask::enumerate(files);
        let mut result = ChainResult::new(&chain.stages, tasks.len(), chain.fail_on_errors);

        // Without a configured dir, worker logs go to a scratch dir and are
        // replayed to stderr after join
        let scratch_logs = match (&self.config.logging.dir, mode) {
            (None, ExecutionMode::Processes { .. }) => match tempfile::TempDir::new() {
                Ok(dir) => Some(dir),
                Err(e) => {
                    self.release(&cache);
                    return Err(WorkerError::from(e).into());
                }
            },
            _ => None,
        };
        let log_dir = self
            .config
            .logging
            .dir
            .clone()
            .or_else(|| scratch_logs.as_ref().map(|dir| dir.path().to_path_buf()));
        let mut pool = WorkerPool::new(mode).with_log_dir(log_dir.clone());
        if let Some(program) = &self.worker_program {
            pool = pool.with_program(program);
        }

        let dispatched = {
            let runner = PipelineRunner::new(&self.stages, self.reader.as_ref());
            let cancel = self.cancel.clone();
            let total = tasks.len();
            let mut on_report = |report: FileReport| {
                if report.state.is_error() && chain.stop_on_error && !result.stopped_on_error {
                    warn!(index = report.index, "File failed, stopping further dispatch");
                    result.stopped_on_error = true;
                    cancel.cancel();
                    events.send(Event::Chain(ChainEvent::StopRequested { index: report.index }));
                }
                events.send(Event::File(FileEvent::Finished(FileProgress {
                    index: report.index,
                    path: report.path.clone(),
                    state: report.state.clone(),
                    completed: result.files_done() + 1,
                    total,
                })));
                result.record(report);
            };
            pool.run(&runner, &self.config, &tasks, &self.cancel, events, &mut on_report)
        };

        let run = match dispatched {
            Ok(run) => run,
            Err(e) => {
                if shared {
                    self.reap(e.started_pids());
                }
                self.release(&cache);
                return Err(e.into());
            }
        };

        if shared {
            self.reap(&run.worker_pids);
        }
        if let (Some(dir), true) = (&log_dir, run.workers > 0) {
            match merge_worker_logs(dir, run.workers) {
                Ok(Some(path)) if scratch_logs.is_some() => {
                    if let Err(e) = replay_log(&path, &mut std::io::stderr().lock()) {
                        warn!(error = %e, "Could not replay worker logs");
                    }
                }
                Ok(Some(path)) => info!(path = %path.display(), "Merged worker logs"),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Could not merge worker logs"),
            }
        }

        for (index, stage) in self.stages.iter_mut().enumerate() {
            stage.finalize(result.stage_reached(index));
        }
        self.release(&cache);

        result.duration_ms = started.elapsed().as_millis() as u64;
        log_summary(&result);
        events.send(Event::Chain(ChainEvent::Completed {
            summary: result.summary(),
        }));
        Ok(result)
    }

    /// Drop dataset references held by worker processes that are gone
    fn reap(&self, pids: &[u32]) {
        let Some(namespace) = &self.config.shared_memory.namespace else {
            return;
        };
        let dir = SharedMemoryBackend::namespace_dir(&self.config.shared_memory.root_dir(), namespace);
        match SharedMemoryBackend::reap(&dir, pids) {
            Ok(0) => {}
            Ok(reaped) => warn!(reaped, "Reaped dataset references left by workers"),
            Err(e) => warn!(error = %e, "Could not reap worker dataset references"),
        }
    }

    fn release(&self, cache: &SharedResourceCache) {
        if let Err(e) = cache.release_all() {
            warn!(error = %e, "Could not release datasets");
        }
    }
}

fn log_summary(result: &ChainResult) {
    for timing in &result.stage_timings {
        info!(
            stage = %timing.name,
            files = timing.calls,
            total_ms = timing.total().as_millis() as u64,
            mean_ms = timing.mean().as_secs_f64() * 1000.0,
            "Stage timing"
        );
    }
    if result.stopped_on_error {
        warn!("Chain stopped on first error");
    }
    info!(
        processed = result.files_processed,
        skipped = result.files_skipped,
        errors = result.errors,
        lost = result.files_lost,
        elapsed_ms = result.duration_ms,
        "Chain completed {} files with {} errors",
        result.files_done(),
        result.errors
    );
}
