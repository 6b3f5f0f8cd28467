//! File dispatch: in-process or across worker processes.

use super::worker::{WorkerJob, WorkerMessage, STOP_COMMAND};
use super::{CancellationToken, FileReport, PipelineRunner};
use crate::config::RunConfig;
use crate::core::record::FileTask;
use crate::error::WorkerError;
use crate::events::{Event, EventSender, WorkerEvent};
use crossbeam_channel::{unbounded, RecvTimeoutError, Sender};
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How files are dispatched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// One file at a time in this process, in list order
    Sequential,
    /// Contiguous partitions across up to `workers` child processes
    Processes { workers: usize },
}

/// What the pool did, beyond the per-file reports
#[derive(Debug, Clone, Default)]
pub struct PoolRun {
    /// Number of workers started (0 in sequential mode)
    pub workers: usize,
    /// Process ids of the workers, for reaping their shared references
    pub worker_pids: Vec<u32>,
}

/// Dispatches files and feeds their reports back to a single callback
pub struct WorkerPool {
    mode: ExecutionMode,
    program: PathBuf,
    log_dir: Option<PathBuf>,
}

impl WorkerPool {
    pub fn new(mode: ExecutionMode) -> Self {
        let program = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("run-chain"));
        Self {
            mode,
            program,
            log_dir: None,
        }
    }

    pub fn sequential() -> Self {
        Self::new(ExecutionMode::Sequential)
    }

    pub fn processes(workers: usize) -> Self {
        Self::new(ExecutionMode::Processes {
            workers: workers.max(1),
        })
    }

    /// Executable started as `<program> worker`
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    /// Send each worker's stderr to `<dir>/worker-<k>.log`
    pub fn with_log_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.log_dir = dir;
        self
    }

    /// Dispatch `tasks`. `on_report` runs on the calling thread, once per
    /// file that reached a terminal state. `cancel` is checked between
    /// dispatches; files already running finish.
    pub fn run(
        &self,
        runner: &PipelineRunner<'_>,
        config: &RunConfig,
        tasks: &[FileTask],
        cancel: &CancellationToken,
        events: &EventSender,
        on_report: &mut dyn FnMut(FileReport),
    ) -> Result<PoolRun, WorkerError> {
        match self.mode {
            ExecutionMode::Sequential => {
                for (position, task) in tasks.iter().enumerate() {
                    if cancel.is_cancelled() {
                        info!(remaining = tasks.len() - position, "Dispatch stopped");
                        break;
                    }
                    on_report(runner.run(task));
                }
                Ok(PoolRun::default())
            }
            ExecutionMode::Processes { workers } => {
                self.run_processes(workers, config, tasks, cancel, events, on_report)
            }
        }
    }

    fn run_processes(
        &self,
        workers: usize,
        config: &RunConfig,
        tasks: &[FileTask],
        cancel: &CancellationToken,
        events: &EventSender,
        on_report: &mut dyn FnMut(FileReport),
    ) -> Result<PoolRun, WorkerError> {
        let partitions = partition(tasks, workers);
        let (tx, rx) = unbounded();

        let mut handles = Vec::with_capacity(partitions.len());
        for (worker_id, files) in partitions.into_iter().enumerate() {
            let handle = match self.spawn(worker_id, config, files, tx.clone()) {
                Ok(handle) => handle,
                Err(e) if handles.is_empty() => return Err(e),
                Err(e) => {
                    error!(worker_id, error = %e, "Worker spawn failed, stopping started workers");
                    let pids = handles.iter_mut().map(WorkerHandle::kill).collect();
                    return Err(WorkerError::Aborted {
                        pids,
                        source: Box::new(e),
                    });
                }
            };
            events.send(Event::Worker(WorkerEvent::Spawned {
                worker_id,
                pid: handle.pid,
                files: handle.files.len(),
            }));
            handles.push(handle);
        }
        drop(tx);
        info!(workers = handles.len(), program = %self.program.display(), "Workers started");

        let mut stop_sent = false;
        loop {
            if cancel.is_cancelled() && !stop_sent {
                for handle in &mut handles {
                    handle.request_stop();
                }
                stop_sent = true;
            }
            match rx.recv_timeout(POLL_INTERVAL) {
                Ok(Inbound::Message { worker_id, message }) => {
                    let handle = &mut handles[worker_id];
                    match message {
                        WorkerMessage::Ready { pid } => debug!(worker_id, pid, "Worker ready"),
                        WorkerMessage::File(report) => {
                            handle.reported.insert(report.index);
                            on_report(report);
                        }
                        WorkerMessage::InitFailed { reason } => {
                            error!(worker_id, %reason, "Worker failed to initialize");
                            handle.init_failed = Some(reason);
                        }
                        WorkerMessage::Finished { stopped } => handle.finished = Some(stopped),
                    }
                }
                Ok(Inbound::Garbled { worker_id, line }) => {
                    warn!(worker_id, %line, "Unreadable worker message");
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        let mut run = PoolRun {
            workers: handles.len(),
            worker_pids: Vec::with_capacity(handles.len()),
        };
        for mut handle in handles {
            let status = handle.join();
            run.worker_pids.push(handle.pid);

            let lost_reason = match (&handle.init_failed, handle.finished) {
                (Some(reason), _) => Some(format!("worker {} failed to initialize: {reason}", handle.worker_id)),
                (None, None) => Some(format!("worker {} exited unexpectedly ({status})", handle.worker_id)),
                (None, Some(false)) => Some(format!("worker {} did not report the file", handle.worker_id)),
                (None, Some(true)) => None,
            };

            let mut lost = 0;
            if let Some(reason) = lost_reason {
                for task in handle.files.iter().filter(|t| !handle.reported.contains(&t.index)) {
                    on_report(FileReport::lost(task, reason.clone()));
                    lost += 1;
                }
                if lost > 0 {
                    error!(worker_id = handle.worker_id, lost, %reason, "Files lost with worker");
                }
            }
            events.send(Event::Worker(WorkerEvent::Exited {
                worker_id: handle.worker_id,
                lost,
            }));
        }
        Ok(run)
    }

    fn spawn(
        &self,
        worker_id: usize,
        config: &RunConfig,
        files: Vec<FileTask>,
        tx: Sender<Inbound>,
    ) -> Result<WorkerHandle, WorkerError> {
        let mut command = Command::new(&self.program);
        command
            .arg("worker")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped());
        match &self.log_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                command.stderr(Stdio::from(File::create(worker_log_path(dir, worker_id))?));
            }
            None => {
                command.stderr(Stdio::inherit());
            }
        }

        let mut child = command.spawn().map_err(|source| WorkerError::Spawn {
            program: self.program.clone(),
            source,
        })?;
        let pid = child.id();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| WorkerError::Protocol("worker stdout was not captured".into()))?;
        let mut stdin = child.stdin.take();

        let job = WorkerJob {
            worker_id,
            config: config.clone(),
            files: files.clone(),
        };
        if let Some(pipe) = stdin.as_mut() {
            if let Err(e) = write_job(pipe, &job) {
                // The reader thread sees the closed stdout and the files are lost
                warn!(worker_id, error = %e, "Could not send job to worker");
            }
        }

        let reader = thread::spawn(move || read_messages(worker_id, stdout, tx));
        Ok(WorkerHandle {
            worker_id,
            pid,
            child,
            stdin,
            files,
            reported: HashSet::new(),
            finished: None,
            init_failed: None,
            reader: Some(reader),
        })
    }
}

/// Split into at most `parts` contiguous, near-equal chunks; the first
/// chunks take the remainder
pub fn partition(tasks: &[FileTask], parts: usize) -> Vec<Vec<FileTask>> {
    let parts = parts.min(tasks.len());
    if parts == 0 {
        return Vec::new();
    }
    let base = tasks.len() / parts;
    let extra = tasks.len() % parts;

    let mut chunks = Vec::with_capacity(parts);
    let mut start = 0;
    for k in 0..parts {
        let len = base + usize::from(k < extra);
        chunks.push(tasks[start..start + len].to_vec());
        start += len;
    }
    chunks
}

/// Log file of one worker
pub(crate) fn worker_log_path(dir: &Path, worker_id: usize) -> PathBuf {
    dir.join(format!("worker-{worker_id}.log"))
}

enum Inbound {
    Message {
        worker_id: usize,
        message: WorkerMessage,
    },
    Garbled {
        worker_id: usize,
        line: String,
    },
}

struct WorkerHandle {
    worker_id: usize,
    pid: u32,
    child: Child,
    stdin: Option<ChildStdin>,
    files: Vec<FileTask>,
    reported: HashSet<usize>,
    finished: Option<bool>,
    init_failed: Option<String>,
    reader: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    fn request_stop(&mut self) {
        if let Some(stdin) = self.stdin.as_mut() {
            let sent = writeln!(stdin, "{STOP_COMMAND}").and_then(|_| stdin.flush());
            if let Err(e) = sent {
                debug!(worker_id = self.worker_id, error = %e, "Stop request not delivered");
            }
        }
    }

    /// Close stdin, wait for exit and describe the exit status
    fn join(&mut self) -> String {
        self.stdin = None;
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        match self.child.wait() {
            Ok(status) => status.to_string(),
            Err(e) => format!("wait failed: {e}"),
        }
    }
}

impl WorkerHandle {
    /// Kill the process and wait for it, returning its pid
    fn kill(&mut self) -> u32 {
        self.stdin = None;
        if let Err(e) = self.child.kill() {
            debug!(worker_id = self.worker_id, error = %e, "Worker already exited");
        }
        let _ = self.child.wait();
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        self.pid
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

fn write_job(stdin: &mut ChildStdin, job: &WorkerJob) -> Result<(), WorkerError> {
    serde_json::to_writer(&mut *stdin, job).map_err(|e| WorkerError::Protocol(e.to_string()))?;
    stdin.write_all(b"\n")?;
    stdin.flush()?;
    Ok(())
}

fn read_messages(worker_id: usize, stdout: impl std::io::Read, tx: Sender<Inbound>) {
    for line in BufReader::new(stdout).lines() {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        let inbound = match serde_json::from_str(&line) {
            Ok(message) => Inbound::Message { worker_id, message },
            Err(_) => Inbound::Garbled { worker_id, line },
        };
        if tx.send(inbound).is_err() {
            break;
        }
    }
}
