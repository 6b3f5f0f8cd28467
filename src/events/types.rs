//! Event type definitions for progress reporting.

use crate::core::pipeline::{FileState, RunSummary};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// All events emitted while running a chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    /// Run-level events
    Chain(ChainEvent),
    /// Per-file events
    File(FileEvent),
    /// Worker process events (multi-processing only)
    Worker(WorkerEvent),
}

/// Run-level events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ChainEvent {
    /// Stages initialized, dispatch about to begin
    Started {
        name: String,
        stages: Vec<String>,
        total_files: usize,
        /// Worker processes (0 = sequential)
        workers: usize,
    },
    /// A failed file triggered stop-on-error
    StopRequested { index: usize },
    /// All files reported and stages finalized
    Completed { summary: RunSummary },
    /// The run could not start
    Error { message: String },
}

/// Per-file events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FileEvent {
    /// A file reached a terminal state
    Finished(FileProgress),
}

/// Progress information after each file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileProgress {
    /// Position of the file in the input list
    pub index: usize,
    pub path: PathBuf,
    pub state: FileState,
    /// Files with a terminal state so far, this one included
    pub completed: usize,
    /// Files in the run
    pub total: usize,
}

/// Worker process events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WorkerEvent {
    /// A worker process was started
    Spawned {
        worker_id: usize,
        pid: u32,
        files: usize,
    },
    /// A worker process exited; `lost` files were never reported
    Exited { worker_id: usize, lost: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_are_serializable() {
        let event = Event::File(FileEvent::Finished(FileProgress {
            index: 3,
            path: PathBuf::from("/data/SIN/2020/01/pass.json"),
            state: FileState::Skipped {
                stage: 1,
                reason: "SAR mode".into(),
            },
            completed: 4,
            total: 10,
        }));

        let json = serde_json::to_string(&event).unwrap();
        let deserialized: Event = serde_json::from_str(&json).unwrap();

        match deserialized {
            Event::File(FileEvent::Finished(p)) => {
                assert_eq!(p.index, 3);
                assert!(matches!(p.state, FileState::Skipped { stage: 1, .. }));
            }
            _ => panic!("Wrong event type"),
        }
    }

    #[test]
    fn run_summary_is_serializable() {
        let summary = RunSummary {
            success: false,
            error_count: 2,
            files_processed: 8,
            files_skipped: 0,
            total_files: 10,
            files_lost: 2,
            duration_ms: 5000,
        };

        let json = serde_json::to_string(&Event::Chain(ChainEvent::Completed { summary })).unwrap();
        assert!(json.contains("\"files_lost\":2"));
    }
}
