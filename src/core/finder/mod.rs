//! # Finder Module
//!
//! Selects the input files for a run.
//!
//! ## Selectors
//! - `L1bFinder` - walks a base directory for CryoSat-2 L1b files, filtered
//!   by instrument mode, acquisition year and month, and baseline letter
//! - `FileList` - an explicit list (the `--file` and `--dir` overrides)
//!
//! A base directory that does not exist is an error. A directory with no
//! matching files is not: it yields an empty list.
//!
//! ## Example
//! ```rust,ignore
//! let finder = L1bFinder::from_settings(&config.finder)?;
//! let files = finder.select()?;
//! ```

mod filter;
mod walker;

pub use filter::{L1bFilter, L1bName};
pub use walker::{FinderConfig, L1bFinder};

use crate::error::FinderError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Produces the ordered list of files to process
pub trait FileSelector: Send + Sync {
    fn select(&self) -> Result<Vec<PathBuf>, FinderError>;
}

/// Radar altimeter operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstrumentMode {
    /// Low resolution mode
    #[serde(rename = "LRM")]
    Lrm,
    /// SAR interferometric mode
    #[serde(rename = "SIN")]
    Sin,
    /// SAR mode
    #[serde(rename = "SAR")]
    Sar,
}

impl InstrumentMode {
    /// Map a `sir_op_mode` attribute value ("LRM", "SARIN", "SAR")
    pub fn from_op_mode(value: &str) -> Option<Self> {
        match value.trim().to_uppercase().as_str() {
            "LRM" => Some(InstrumentMode::Lrm),
            "SARIN" => Some(InstrumentMode::Sin),
            "SAR" => Some(InstrumentMode::Sar),
            _ => None,
        }
    }

    /// Short code used in file names and context values
    pub fn as_str(&self) -> &'static str {
        match self {
            InstrumentMode::Lrm => "LRM",
            InstrumentMode::Sin => "SIN",
            InstrumentMode::Sar => "SAR",
        }
    }
}

impl fmt::Display for InstrumentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstrumentMode {
    type Err = FinderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "LRM" => Ok(InstrumentMode::Lrm),
            "SIN" => Ok(InstrumentMode::Sin),
            "SAR" => Ok(InstrumentMode::Sar),
            other => Err(FinderError::InvalidCriteria(format!(
                "unknown instrument mode '{other}' (expected LRM, SIN or SAR)"
            ))),
        }
    }
}

/// An explicit, already ordered file list
#[derive(Debug, Clone, Default)]
pub struct FileList {
    files: Vec<PathBuf>,
    max_files: Option<usize>,
}

impl FileList {
    pub fn new(files: Vec<PathBuf>) -> Self {
        Self {
            files,
            max_files: None,
        }
    }

    pub fn with_max_files(mut self, max_files: Option<usize>) -> Self {
        self.max_files = max_files;
        self
    }
}

impl FileSelector for FileList {
    fn select(&self) -> Result<Vec<PathBuf>, FinderError> {
        let mut files = self.files.clone();
        if let Some(max) = self.max_files {
            files.truncate(max);
        }
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_mode_maps_to_short_codes() {
        assert_eq!(InstrumentMode::from_op_mode("SARIN"), Some(InstrumentMode::Sin));
        assert_eq!(InstrumentMode::from_op_mode("lrm "), Some(InstrumentMode::Lrm));
        assert_eq!(InstrumentMode::from_op_mode("SIN"), None);
        assert_eq!(InstrumentMode::Sin.to_string(), "SIN");
    }

    #[test]
    fn mode_parses_short_codes() {
        assert_eq!("sar".parse::<InstrumentMode>().unwrap(), InstrumentMode::Sar);
        assert!(matches!(
            "SARIN".parse::<InstrumentMode>(),
            Err(FinderError::InvalidCriteria(_))
        ));
    }

    #[test]
    fn file_list_keeps_order_and_truncates() {
        let list = FileList::new(vec!["b".into(), "a".into(), "c".into()]).with_max_files(Some(2));
        assert_eq!(list.select().unwrap(), vec![PathBuf::from("b"), PathBuf::from("a")]);
    }
}
