//! # Record Module
//!
//! Opens input files into read-only record handles.
//!
//! The engine never looks inside a record; it opens one per file and hands
//! it to every stage. The built-in reader understands JSON records:
//!
//! ```json
//! {
//!   "attributes": { "sir_op_mode": "SARIN" },
//!   "variables": { "lat_20_ku": [-77.1, -77.2], "x_20_ku": [1000.0, 1010.0] }
//! }
//! ```

use crate::core::context::Value;
use crate::error::RecordError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// One file scheduled for processing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTask {
    /// Position of the file in the input list
    pub index: usize,
    /// Path of the input file
    pub path: PathBuf,
}

impl FileTask {
    /// Number a list of paths in input order
    pub fn enumerate(paths: Vec<PathBuf>) -> Vec<FileTask> {
        paths
            .into_iter()
            .enumerate()
            .map(|(index, path)| FileTask { index, path })
            .collect()
    }
}

/// Read-only view of one input file
pub trait Record: Send + Sync {
    /// Path the record was opened from
    fn path(&self) -> &Path;

    /// Global attribute by name
    fn attribute(&self, name: &str) -> Option<&Value>;

    /// Numeric variable by name
    fn variable(&self, name: &str) -> Option<&[f64]>;

    /// Attribute as text, if present and textual
    fn text_attribute(&self, name: &str) -> Option<&str> {
        match self.attribute(name) {
            Some(Value::Text(s)) => Some(s),
            _ => None,
        }
    }
}

/// Opens file identifiers into record handles
pub trait RecordReader: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn Record>, RecordError>;
}

/// A record parsed from a JSON file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JsonRecord {
    #[serde(skip)]
    path: PathBuf,
    #[serde(default)]
    attributes: BTreeMap<String, Value>,
    #[serde(default)]
    variables: BTreeMap<String, Vec<f64>>,
}

impl JsonRecord {
    /// Build a record in memory (used by tests and synthetic inputs)
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_attribute(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.to_string(), value.into());
        self
    }

    pub fn with_variable(mut self, name: &str, values: Vec<f64>) -> Self {
        self.variables.insert(name.to_string(), values);
        self
    }

    /// Serialize to the on-disk JSON layout
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

impl Record for JsonRecord {
    fn path(&self) -> &Path {
        &self.path
    }

    fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    fn variable(&self, name: &str) -> Option<&[f64]> {
        self.variables.get(name).map(Vec::as_slice)
    }
}

/// Reader for JSON records
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonRecordReader;

impl RecordReader for JsonRecordReader {
    fn open(&self, path: &Path) -> Result<Box<dyn Record>, RecordError> {
        let text = std::fs::read_to_string(path).map_err(|e| RecordError::Open {
            path: path.to_path_buf(),
            source: e,
        })?;
        let mut record: JsonRecord =
            serde_json::from_str(&text).map_err(|e| RecordError::Parse {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        record.path = path.to_path_buf();
        Ok(Box::new(record))
    }
}
