//! Run-level aggregation of file reports.

use super::runner::{FileReport, FileState};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Cumulative `process` time of one stage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageTiming {
    pub name: String,
    /// Number of files the stage ran on
    pub calls: usize,
    pub total_micros: u64,
}

impl StageTiming {
    pub fn total(&self) -> Duration {
        Duration::from_micros(self.total_micros)
    }

    pub fn mean(&self) -> Duration {
        if self.calls == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.total_micros / self.calls as u64)
    }
}

/// Short summary handed to callers and printed by the CLI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub success: bool,
    pub error_count: usize,
    pub files_processed: usize,
    pub files_skipped: usize,
    pub total_files: usize,
    pub files_lost: usize,
    pub duration_ms: u64,
}

/// Everything known about a finished run
#[derive(Debug, Clone, Serialize)]
pub struct ChainResult {
    pub files_total: usize,
    /// Files that went through every stage
    pub files_processed: usize,
    pub files_skipped: usize,
    /// Failed files plus files lost with a crashed worker
    pub errors: usize,
    pub files_lost: usize,
    pub stopped_on_error: bool,
    pub fail_on_errors: bool,
    pub stage_timings: Vec<StageTiming>,
    /// Reports in the order they were aggregated
    pub reports: Vec<FileReport>,
    pub duration_ms: u64,
    #[serde(skip)]
    last_stop: Vec<Option<usize>>,
}

impl ChainResult {
    pub fn new(stage_names: &[String], files_total: usize, fail_on_errors: bool) -> Self {
        Self {
            files_total,
            files_processed: 0,
            files_skipped: 0,
            errors: 0,
            files_lost: 0,
            stopped_on_error: false,
            fail_on_errors,
            stage_timings: stage_names
                .iter()
                .map(|name| StageTiming {
                    name: name.clone(),
                    ..Default::default()
                })
                .collect(),
            reports: Vec::with_capacity(files_total),
            duration_ms: 0,
            last_stop: vec![None; stage_names.len()],
        }
    }

    /// Merge one file report
    pub fn record(&mut self, report: FileReport) {
        match &report.state {
            FileState::Completed => self.files_processed += 1,
            FileState::Skipped { .. } => self.files_skipped += 1,
            FileState::Failed { .. } => self.errors += 1,
            FileState::Lost { .. } => {
                self.errors += 1;
                self.files_lost += 1;
            }
        }

        for (timing, micros) in self.stage_timings.iter_mut().zip(&report.stage_micros) {
            timing.calls += 1;
            timing.total_micros += micros;
        }

        if let Some(stop) = report.stage_reached {
            let reached = (stop + 1).min(self.last_stop.len());
            for slot in &mut self.last_stop[..reached] {
                *slot = Some(stop);
            }
        }

        self.reports.push(report);
    }

    /// Files with a terminal state so far
    pub fn files_done(&self) -> usize {
        self.files_processed + self.files_skipped + self.errors
    }

    /// Stop position of the last aggregated file that reached `stage`
    pub fn stage_reached(&self, stage: usize) -> Option<usize> {
        self.last_stop.get(stage).copied().flatten()
    }

    pub fn success(&self) -> bool {
        !self.stopped_on_error && !(self.fail_on_errors && self.errors > 0)
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            success: self.success(),
            error_count: self.errors,
            files_processed: self.files_processed,
            files_skipped: self.files_skipped,
            total_files: self.files_total,
            files_lost: self.files_lost,
            duration_ms: self.duration_ms,
        }
    }

    /// Reports sorted by file index
    pub fn reports_by_index(&self) -> Vec<&FileReport> {
        let mut reports: Vec<&FileReport> = self.reports.iter().collect();
        reports.sort_by_key(|r| r.index);
        reports
    }
}
