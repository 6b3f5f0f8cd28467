//! # Context Module
//!
//! Per-file key/value store passed down the stage list.
//!
//! A context is created fresh when a file starts its pipeline run and dropped
//! when the run ends. Keys are written once: a stage that writes a key an
//! earlier stage already produced gets `ContextError::DuplicateKey`.

use crate::error::ContextError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// Key seeded by the runner with the input file path
pub const FILE_NAME_KEY: &str = "file_name";

/// Key seeded by the runner with the file's position in the input list
pub const FILE_INDEX_KEY: &str = "file_index";

/// A value stored in a context or a record attribute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Ints(Vec<i64>),
    Floats(Vec<f64>),
    Flags(Vec<bool>),
}

impl Value {
    /// Short type name used in error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Ints(_) => "int array",
            Value::Floats(_) => "float array",
            Value::Flags(_) => "flag array",
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<usize> for Value {
    fn from(v: usize) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<f64>> for Value {
    fn from(v: Vec<f64>) -> Self {
        Value::Floats(v)
    }
}

impl From<Vec<bool>> for Value {
    fn from(v: Vec<bool>) -> Self {
        Value::Flags(v)
    }
}

/// Per-file working store
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Context {
    values: HashMap<String, Value>,
}

impl Context {
    /// Create an empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh context for one file, seeded with its name and index
    pub fn for_file(path: &Path, index: usize) -> Self {
        let mut values = HashMap::new();
        values.insert(FILE_NAME_KEY.to_string(), Value::Text(path.display().to_string()));
        values.insert(FILE_INDEX_KEY.to_string(), Value::from(index));
        Self { values }
    }

    /// Write a key. Each key may be written once per file.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Result<(), ContextError> {
        let key = key.into();
        if self.values.contains_key(&key) {
            return Err(ContextError::DuplicateKey { key });
        }
        self.values.insert(key, value.into());
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Keys in sorted order
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.values.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    /// Snapshot with deterministic ordering, handy for comparing runs
    pub fn to_sorted(&self) -> BTreeMap<String, Value> {
        self.values
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn require(&self, key: &str) -> Result<&Value, ContextError> {
        self.values.get(key).ok_or_else(|| ContextError::MissingKey {
            key: key.to_string(),
        })
    }

    pub fn text(&self, key: &str) -> Result<&str, ContextError> {
        match self.require(key)? {
            Value::Text(s) => Ok(s),
            _ => Err(mismatch(key, "text")),
        }
    }

    pub fn int(&self, key: &str) -> Result<i64, ContextError> {
        match self.require(key)? {
            Value::Int(v) => Ok(*v),
            _ => Err(mismatch(key, "int")),
        }
    }

    pub fn float(&self, key: &str) -> Result<f64, ContextError> {
        match self.require(key)? {
            Value::Float(v) => Ok(*v),
            Value::Int(v) => Ok(*v as f64),
            _ => Err(mismatch(key, "float")),
        }
    }

    pub fn flag(&self, key: &str) -> Result<bool, ContextError> {
        match self.require(key)? {
            Value::Bool(v) => Ok(*v),
            _ => Err(mismatch(key, "bool")),
        }
    }

    pub fn floats(&self, key: &str) -> Result<&[f64], ContextError> {
        match self.require(key)? {
            Value::Floats(v) => Ok(v),
            _ => Err(mismatch(key, "float array")),
        }
    }

    pub fn flags(&self, key: &str) -> Result<&[bool], ContextError> {
        match self.require(key)? {
            Value::Flags(v) => Ok(v),
            _ => Err(mismatch(key, "flag array")),
        }
    }
}

fn mismatch(key: &str, expected: &'static str) -> ContextError {
    ContextError::TypeMismatch {
        key: key.to_string(),
        expected,
    }
}
