//! Per-file stage driver.

use crate::core::context::Context;
use crate::core::record::{FileTask, RecordReader};
use crate::core::stage::{Outcome, Stage};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, error, info, info_span};

/// Terminal state of one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FileState {
    /// Every stage returned Continue
    Completed,
    /// A stage decided the file needs no further work
    Skipped { stage: usize, reason: String },
    /// A stage failed, or the record could not be opened (`stage` is None)
    Failed { stage: Option<usize>, reason: String },
    /// The worker holding the file exited before reporting it
    Lost { reason: String },
}

impl FileState {
    /// Failed and lost files both count as errors
    pub fn is_error(&self) -> bool {
        matches!(self, FileState::Failed { .. } | FileState::Lost { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            FileState::Completed => "completed",
            FileState::Skipped { .. } => "skipped",
            FileState::Failed { .. } => "failed",
            FileState::Lost { .. } => "lost",
        }
    }
}

impl std::fmt::Display for FileState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileState::Completed => write!(f, "completed"),
            FileState::Skipped { stage, reason } => write!(f, "skipped at stage {stage}: {reason}"),
            FileState::Failed {
                stage: Some(stage),
                reason,
            } => write!(f, "failed at stage {stage}: {reason}"),
            FileState::Failed { stage: None, reason } => write!(f, "failed to open: {reason}"),
            FileState::Lost { reason } => write!(f, "lost: {reason}"),
        }
    }
}

/// What happened to one file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileReport {
    pub index: usize,
    pub path: PathBuf,
    pub state: FileState,
    /// Index of the stage the file stopped at (the last stage when completed)
    pub stage_reached: Option<usize>,
    /// Time spent in each stage that ran, in microseconds
    pub stage_micros: Vec<u64>,
}

impl FileReport {
    /// Report for a file whose worker went away
    pub fn lost(task: &FileTask, reason: impl Into<String>) -> Self {
        Self {
            index: task.index,
            path: task.path.clone(),
            state: FileState::Lost {
                reason: reason.into(),
            },
            stage_reached: None,
            stage_micros: Vec::new(),
        }
    }
}

/// Runs the configured stages over one file at a time
pub struct PipelineRunner<'a> {
    stages: &'a [Box<dyn Stage>],
    reader: &'a dyn RecordReader,
}

impl<'a> PipelineRunner<'a> {
    pub fn new(stages: &'a [Box<dyn Stage>], reader: &'a dyn RecordReader) -> Self {
        Self { stages, reader }
    }

    /// Run one file through the chain
    pub fn run(&self, task: &FileTask) -> FileReport {
        self.run_with_context(task).0
    }

    /// Run one file and also hand back its final context
    pub fn run_with_context(&self, task: &FileTask) -> (FileReport, Context) {
        let span = info_span!("file", index = task.index);
        let _enter = span.enter();

        let mut context = Context::for_file(&task.path, task.index);
        let mut report = FileReport {
            index: task.index,
            path: task.path.clone(),
            state: FileState::Completed,
            stage_reached: None,
            stage_micros: Vec::with_capacity(self.stages.len()),
        };

        info!(path = %task.path.display(), "Processing file");
        let record = match self.reader.open(&task.path) {
            Ok(record) => record,
            Err(e) => {
                error!(error = %e, "Could not open record");
                report.state = FileState::Failed {
                    stage: None,
                    reason: e.to_string(),
                };
                return (report, context);
            }
        };

        for (index, stage) in self.stages.iter().enumerate() {
            let started = Instant::now();
            let outcome = stage.process(record.as_ref(), &mut context);
            report.stage_micros.push(started.elapsed().as_micros() as u64);
            report.stage_reached = Some(index);

            match outcome {
                Outcome::Continue => {}
                Outcome::Skip(reason) => {
                    info!(stage = stage.name(), %reason, "File skipped");
                    report.state = FileState::Skipped {
                        stage: index,
                        reason,
                    };
                    return (report, context);
                }
                Outcome::Fail(reason) => {
                    error!(stage = stage.name(), %reason, "Stage failed");
                    report.state = FileState::Failed {
                        stage: Some(index),
                        reason,
                    };
                    return (report, context);
                }
            }
        }

        debug!(keys = context.len(), "File completed");
        (report, context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::record::{JsonRecord, Record};
    use crate::error::RecordError;
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Serves records from memory
    struct MapReader(HashMap<PathBuf, JsonRecord>);

    impl RecordReader for MapReader {
        fn open(&self, path: &Path) -> Result<Box<dyn Record>, RecordError> {
            self.0
                .get(path)
                .cloned()
                .map(|r| Box::new(r) as Box<dyn Record>)
                .ok_or_else(|| RecordError::Parse {
                    path: path.to_path_buf(),
                    reason: "not in map".into(),
                })
        }
    }

    /// Counts its calls and answers with a fixed outcome
    struct Scripted {
        name: &'static str,
        outcome: Outcome,
        calls: Arc<AtomicUsize>,
    }

    impl Stage for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        fn process(&self, _record: &dyn Record, context: &mut Context) -> Outcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.outcome.is_continue() {
                return context.insert(self.name, true).into();
            }
            self.outcome.clone()
        }
    }

    fn chain(outcomes: &[Outcome]) -> (Vec<Box<dyn Stage>>, Vec<Arc<AtomicUsize>>) {
        const NAMES: [&str; 4] = ["s0", "s1", "s2", "s3"];
        let counters: Vec<_> = outcomes.iter().map(|_| Arc::new(AtomicUsize::new(0))).collect();
        let stages = outcomes
            .iter()
            .zip(&counters)
            .enumerate()
            .map(|(i, (outcome, calls))| {
                Box::new(Scripted {
                    name: NAMES[i],
                    outcome: outcome.clone(),
                    calls: Arc::clone(calls),
                }) as Box<dyn Stage>
            })
            .collect();
        (stages, counters)
    }

    fn reader() -> MapReader {
        let path = PathBuf::from("a.json");
        MapReader(HashMap::from([(path.clone(), JsonRecord::new(path))]))
    }

    fn task() -> FileTask {
        FileTask {
            index: 4,
            path: PathBuf::from("a.json"),
        }
    }

    fn calls(counters: &[Arc<AtomicUsize>]) -> Vec<usize> {
        counters.iter().map(|c| c.load(Ordering::SeqCst)).collect()
    }

    #[test]
    fn all_continue_completes() {
        let (stages, counters) = chain(&[Outcome::Continue, Outcome::Continue, Outcome::Continue]);
        let reader = reader();

        let (report, context) = PipelineRunner::new(&stages, &reader).run_with_context(&task());

        assert_eq!(report.state, FileState::Completed);
        assert_eq!(report.stage_reached, Some(2));
        assert_eq!(report.stage_micros.len(), 3);
        assert_eq!(calls(&counters), vec![1, 1, 1]);
        assert!(context.flag("s2").unwrap());
        assert_eq!(context.int("file_index").unwrap(), 4);
    }

    #[test]
    fn skip_stops_later_stages() {
        let (stages, counters) = chain(&[
            Outcome::Continue,
            Outcome::skip("not over ice"),
            Outcome::Continue,
        ]);
        let reader = reader();

        let report = PipelineRunner::new(&stages, &reader).run(&task());

        assert_eq!(
            report.state,
            FileState::Skipped {
                stage: 1,
                reason: "not over ice".into()
            }
        );
        assert!(!report.state.is_error());
        assert_eq!(report.stage_reached, Some(1));
        assert_eq!(calls(&counters), vec![1, 1, 0]);
    }

    #[test]
    fn fail_stops_later_stages() {
        let (stages, counters) = chain(&[
            Outcome::fail("bad waveform"),
            Outcome::Continue,
        ]);
        let reader = reader();

        let report = PipelineRunner::new(&stages, &reader).run(&task());

        assert!(report.state.is_error());
        assert_eq!(report.stage_reached, Some(0));
        assert_eq!(calls(&counters), vec![1, 0]);
    }

    #[test]
    fn unopenable_record_fails_before_first_stage() {
        let (stages, counters) = chain(&[Outcome::Continue]);
        let reader = MapReader(HashMap::new());

        let report = PipelineRunner::new(&stages, &reader).run(&task());

        assert!(matches!(report.state, FileState::Failed { stage: None, .. }));
        assert_eq!(report.stage_reached, None);
        assert_eq!(calls(&counters), vec![0]);
    }

    #[test]
    fn same_file_gives_same_context() {
        let (stages, _) = chain(&[Outcome::Continue, Outcome::Continue]);
        let reader = reader();
        let runner = PipelineRunner::new(&stages, &reader);

        let (_, first) = runner.run_with_context(&task());
        let (_, second) = runner.run_with_context(&task());

        assert_eq!(first.to_sorted(), second.to_sorted());
    }

    #[test]
    fn state_display_names_the_stage() {
        let state = FileState::Failed {
            stage: Some(2),
            reason: "no DEM".into(),
        };
        assert_eq!(state.to_string(), "failed at stage 2: no DEM");
    }

    #[test]
    fn state_serializes_with_kind_tag() {
        let json = serde_json::to_value(FileState::Skipped {
            stage: 2,
            reason: "sar".into(),
        })
        .unwrap();
        assert_eq!(json["kind"], "skipped");
        assert_eq!(json["stage"], 2);
    }
}
