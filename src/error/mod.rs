//! # Error Module
//!
//! Error types for the altimetry chain runner.
//!
//! ## Design Principles
//! - **Stage failures are values** - a stage reports `Outcome::Fail`, it never
//!   returns one of these errors from `process`
//! - **Only fatal conditions abort a run** - bad configuration, unreadable
//!   datasets at startup, a stage that cannot initialize
//! - **Include context** - paths, stage names, dataset names

use std::path::PathBuf;
use thiserror::Error;

/// Top-level application error
#[derive(Error, Debug)]
pub enum ChainError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("File selection error: {0}")]
    Finder(#[from] FinderError),

    #[error("Stage initialization error: {0}")]
    Stage(#[from] StageError),

    #[error("Dataset error: {0}")]
    Dataset(#[from] DatasetError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Logging setup failed: {0}")]
    Logging(String),
}

/// Errors raised while loading or validating the run configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {path}")]
    NotFound { path: PathBuf },

    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unsupported config format '{extension}' (expected .toml or .json)")]
    UnsupportedFormat { extension: String },

    #[error("Failed to parse config: {reason}")]
    Parse { reason: String },

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("Unknown stage '{name}'. Run `run-chain stages` to list the registered stages.")]
    UnknownStage { name: String },

    #[error("Stage '{stage}' reads context key '{key}' but no earlier stage produces it")]
    SchemaViolation { stage: String, key: String },
}

/// Errors raised by file selectors
#[derive(Error, Debug)]
pub enum FinderError {
    #[error("Base directory not found: {path}")]
    BasePathNotFound { path: PathBuf },

    #[error("Failed to read directory {path}: {source}")]
    ReadDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid selection criteria: {0}")]
    InvalidCriteria(String),
}

/// Fatal errors raised by `Stage::initialize`
#[derive(Error, Debug)]
pub enum StageError {
    #[error("Stage '{stage}' requires config key '{key}'")]
    MissingConfig { stage: String, key: String },

    #[error("Stage '{stage}' has an invalid value for '{key}': {reason}")]
    InvalidConfig {
        stage: String,
        key: String,
        reason: String,
    },

    #[error("Stage '{stage}' could not open resource: {source}")]
    Resource {
        stage: String,
        #[source]
        source: DatasetError,
    },
}

/// Errors raised by the shared resource cache
#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("Dataset '{name}' is not defined in the [datasets] config section")]
    Unknown { name: String },

    #[error("Failed to read dataset '{name}' from {path}: {source}")]
    Load {
        name: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid dataset header {path}: {reason}")]
    InvalidHeader { path: PathBuf, reason: String },

    #[error("Dataset '{name}' has {actual} values but its header declares {expected}")]
    ShapeMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("Dataset '{name}' is a {actual}, expected a {expected}")]
    WrongKind {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("Shared segment {path} failed: {source}")]
    Segment {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Shared segment {path} is corrupt: {reason}. Delete it and rerun.")]
    CorruptSegment { path: PathBuf, reason: String },

    #[error("Timed out after {waited_secs}s waiting for another process to publish '{name}'")]
    PublishTimeout { name: String, waited_secs: u64 },

    #[error("Dataset cache lock was poisoned")]
    Poisoned,
}

/// Errors raised by typed context access
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ContextError {
    #[error("Context key '{key}' was already written for this file")]
    DuplicateKey { key: String },

    #[error("Context key '{key}' is not present")]
    MissingKey { key: String },

    #[error("Context key '{key}' is not a {expected}")]
    TypeMismatch { key: String, expected: &'static str },
}

/// Errors raised when opening a per-file record
#[derive(Error, Debug)]
pub enum RecordError {
    #[error("Could not open record {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not parse record {path}: {reason}")]
    Parse { path: PathBuf, reason: String },
}

/// Errors raised by the multi-process worker pool
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Failed to spawn worker process {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Worker protocol error: {0}")]
    Protocol(String),

    #[error("Worker I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Worker pool aborted after starting {} workers: {source}", pids.len())]
    Aborted {
        /// Workers that were started, then killed
        pids: Vec<u32>,
        #[source]
        source: Box<WorkerError>,
    },
}

impl WorkerError {
    /// Processes started before the pool gave up; they may hold references
    /// to shared datasets
    pub fn started_pids(&self) -> &[u32] {
        match self {
            WorkerError::Aborted { pids, .. } => pids,
            _ => &[],
        }
    }
}

/// Convenience Result type alias
pub type Result<T> = std::result::Result<T, ChainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finder_error_includes_path() {
        let error = FinderError::BasePathNotFound {
            path: PathBuf::from("/raid6/L1B"),
        };
        assert!(error.to_string().contains("/raid6/L1B"));
    }

    #[test]
    fn unknown_stage_suggests_listing() {
        let error = ConfigError::UnknownStage {
            name: "retrack_v2".to_string(),
        };
        let message = error.to_string();
        assert!(message.contains("retrack_v2"));
        assert!(message.contains("run-chain stages"));
    }

    #[test]
    fn stage_error_wraps_into_chain_error() {
        let error: ChainError = StageError::MissingConfig {
            stage: "ref_dem".to_string(),
            key: "dem".to_string(),
        }
        .into();
        let message = error.to_string();
        assert!(message.starts_with("Stage initialization error"));
        assert!(message.contains("'dem'"));
    }

    #[test]
    fn corrupt_segment_suggests_recovery() {
        let error = DatasetError::CorruptSegment {
            path: PathBuf::from("/dev/shm/chain/rema.seg"),
            reason: "bad magic".to_string(),
        };
        assert!(error.to_string().contains("Delete it"));
    }
}
