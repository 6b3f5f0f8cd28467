//! # Worker Protocol
//!
//! Child side of multi-process execution.
//!
//! The parent starts `run-chain worker` and talks to it over its standard
//! streams, one JSON document per line:
//! - stdin, first line: a [`WorkerJob`] (config plus the worker's files)
//! - stdin, later lines: `stop` asks the worker to finish its current file
//!   and exit
//! - stdout: [`WorkerMessage`]s, one per line
//!
//! Logs go to stderr, which the parent points at the worker's log file.

use super::{initialize_stages, CancellationToken, FileReport, PipelineRunner};
use crate::config::RunConfig;
use crate::core::record::{FileTask, JsonRecordReader};
use crate::core::resources::{DatasetSource, GridFileSource, SharedResourceCache};
use crate::core::stage::{Stage, StageRegistry};
use crate::error::{ChainError, WorkerError};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, Write};
use std::sync::Arc;
use std::thread;
use tracing::{info, info_span, warn};

/// Line sent on stdin to stop a worker early
pub const STOP_COMMAND: &str = "stop";

/// Work handed to one worker process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerJob {
    pub worker_id: usize,
    pub config: RunConfig,
    pub files: Vec<FileTask>,
}

/// Messages a worker writes to stdout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Job received, stages about to be initialized
    Ready { pid: u32 },
    /// One file reached a terminal state
    File(FileReport),
    /// A stage could not initialize; no file was attempted
    InitFailed { reason: String },
    /// Normal exit; `stopped` is set when the list was cut short by a stop
    /// request or, under `stop_on_error`, by this worker's own failure
    Finished { stopped: bool },
}

/// Read the job line
pub fn read_job<R: BufRead>(input: &mut R) -> Result<WorkerJob, WorkerError> {
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Err(WorkerError::Protocol("stdin closed before the job arrived".into()));
    }
    serde_json::from_str(&line).map_err(|e| WorkerError::Protocol(format!("bad job: {e}")))
}

/// Line-oriented JSON writer for worker messages
pub struct MessageWriter<W: Write> {
    inner: W,
}

impl<W: Write> MessageWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn send(&mut self, message: &WorkerMessage) -> Result<(), WorkerError> {
        serde_json::to_writer(&mut self.inner, message)
            .map_err(|e| WorkerError::Protocol(e.to_string()))?;
        self.inner.write_all(b"\n")?;
        self.inner.flush()?;
        Ok(())
    }
}

/// Run a job with the built-in record reader and dataset source.
///
/// `control` is the rest of stdin; it is read on a background thread for
/// stop requests.
pub fn serve_job<R, W>(
    job: WorkerJob,
    control: R,
    output: W,
    registry: &StageRegistry,
) -> Result<(), WorkerError>
where
    R: BufRead + Send + 'static,
    W: Write,
{
    let span = info_span!("worker", id = job.worker_id);
    let _enter = span.enter();
    let mut out = MessageWriter::new(output);
    out.send(&WorkerMessage::Ready {
        pid: std::process::id(),
    })?;

    let cancel = CancellationToken::new();
    watch_for_stop(control, cancel.clone());

    let source: Arc<dyn DatasetSource> = Arc::new(GridFileSource);
    let (stages, cache) = match prepare(&job, registry, source) {
        Ok(prepared) => prepared,
        Err(e) => {
            warn!(error = %e, "Worker could not initialize");
            return out.send(&WorkerMessage::InitFailed {
                reason: e.to_string(),
            });
        }
    };

    info!(files = job.files.len(), "Worker started");
    let runner = PipelineRunner::new(&stages, &JsonRecordReader);
    let stop_on_error = job.config.chain.stop_on_error;
    let mut stopped = false;
    for (position, task) in job.files.iter().enumerate() {
        if cancel.is_cancelled() {
            stopped = true;
            break;
        }
        let report = runner.run(task);
        let failed = report.state.is_error();
        out.send(&WorkerMessage::File(report))?;
        if failed && stop_on_error && position + 1 < job.files.len() {
            warn!(index = task.index, "File failed, not starting further files");
            stopped = true;
            break;
        }
    }

    drop(stages);
    if let Err(e) = cache.release_all() {
        warn!(error = %e, "Failed to release datasets");
    }
    info!(stopped, "Worker finished");
    out.send(&WorkerMessage::Finished { stopped })
}

fn prepare(
    job: &WorkerJob,
    registry: &StageRegistry,
    source: Arc<dyn DatasetSource>,
) -> Result<(Vec<Box<dyn Stage>>, SharedResourceCache), ChainError> {
    let shared = job.config.chain.use_shared_memory;
    let cache = SharedResourceCache::from_config(&job.config, source, shared)?;
    let mut stages = registry.build_chain(&job.config.chain.stages)?;
    initialize_stages(&mut stages, &job.config, &cache)?;
    Ok((stages, cache))
}

fn watch_for_stop<R: BufRead + Send + 'static>(control: R, cancel: CancellationToken) {
    thread::spawn(move || {
        for line in control.lines() {
            match line {
                Ok(line) if line.trim() == STOP_COMMAND => {
                    info!("Stop requested");
                    cancel.cancel();
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    });
}
