//! # Stage Module
//!
//! The contract every processing stage implements.
//!
//! ## Lifecycle
//! 1. `initialize` - once per process before any file, loads static
//!    resources; an error aborts the run
//! 2. `process` - once per file, may run concurrently for different files
//! 3. `finalize` - once after all files, in the parent process only
//!
//! ## Key schema
//! Stages declare the context keys they read (`requires`) and write
//! (`produces`). The registry checks at startup that every required key is
//! produced by an earlier stage, or is seeded by the runner
//! (`file_name`, `file_index`).
//!
//! ## Example
//! ```rust,ignore
//! struct Hemisphere;
//!
//! impl Stage for Hemisphere {
//!     fn name(&self) -> &str { "hemisphere" }
//!     fn produces(&self) -> &[&'static str] { &["hemisphere"] }
//!     fn process(&self, record: &dyn Record, context: &mut Context) -> Outcome {
//!         let lat = record.variable("lat_20_ku").unwrap_or_default();
//!         let side = if lat.first().copied().unwrap_or(0.0) < 0.0 { "south" } else { "north" };
//!         context.insert("hemisphere", side).into()
//!     }
//! }
//! ```

mod registry;

pub use registry::{check_schema, StageFactory, StageInfo, StageRegistry};

use crate::config::RunConfig;
use crate::core::context::Context;
use crate::core::record::Record;
use crate::core::resources::{DatasetKind, SharedDataset, SharedResourceCache};
use crate::error::{ContextError, StageError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Result of running one stage on one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    /// Go on to the next stage
    Continue,
    /// The file needs no further processing (not an error)
    Skip(String),
    /// The stage could not process the file
    Fail(String),
}

impl Outcome {
    pub fn skip(reason: impl Into<String>) -> Self {
        Outcome::Skip(reason.into())
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Outcome::Fail(reason.into())
    }

    pub fn is_continue(&self) -> bool {
        matches!(self, Outcome::Continue)
    }
}

impl From<ContextError> for Outcome {
    fn from(error: ContextError) -> Self {
        Outcome::Fail(error.to_string())
    }
}

impl From<Result<(), ContextError>> for Outcome {
    fn from(result: Result<(), ContextError>) -> Self {
        match result {
            Ok(()) => Outcome::Continue,
            Err(e) => e.into(),
        }
    }
}

/// Position of a stage in the configured list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDescriptor {
    pub index: usize,
    pub name: String,
}

impl StageDescriptor {
    /// Describe a stage list in order
    pub fn list(names: &[String]) -> Vec<StageDescriptor> {
        names
            .iter()
            .enumerate()
            .map(|(index, name)| StageDescriptor {
                index,
                name: name.clone(),
            })
            .collect()
    }
}

/// A unit of per-file work
pub trait Stage: Send + Sync {
    /// Registered name
    fn name(&self) -> &str;

    /// Context keys read by `process`
    fn requires(&self) -> &[&'static str] {
        &[]
    }

    /// Context keys written by `process`
    fn produces(&self) -> &[&'static str] {
        &[]
    }

    /// Load static resources. Called once per process before any file.
    fn initialize(&mut self, init: &StageInit<'_>) -> Result<(), StageError> {
        let _ = init;
        Ok(())
    }

    /// Process one file. Must not keep per-file state between calls.
    fn process(&self, record: &dyn Record, context: &mut Context) -> Outcome;

    /// Called once after all files, with the stop position of the last file
    /// that reached this stage (None if none did). Failures are logged here,
    /// never returned.
    fn finalize(&mut self, stage_reached: Option<usize>) {
        let _ = stage_reached;
    }
}

/// Everything a stage may consult while initializing
pub struct StageInit<'a> {
    /// Stage name
    pub name: &'a str,
    /// The stage's own `[stages.<name>]` sub-tree
    pub settings: &'a serde_json::Value,
    /// The whole run configuration
    pub config: &'a RunConfig,
    /// Reference datasets
    pub resources: &'a SharedResourceCache,
}

impl<'a> StageInit<'a> {
    pub fn new(name: &'a str, config: &'a RunConfig, resources: &'a SharedResourceCache) -> Self {
        Self {
            name,
            settings: config.stage_settings(name),
            config,
            resources,
        }
    }

    fn missing(&self, key: &str) -> StageError {
        StageError::MissingConfig {
            stage: self.name.to_string(),
            key: key.to_string(),
        }
    }

    fn invalid(&self, key: &str, reason: impl Into<String>) -> StageError {
        StageError::InvalidConfig {
            stage: self.name.to_string(),
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    /// Deserialize an optional setting
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StageError> {
        match self.settings.get(key) {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| self.invalid(key, e.to_string())),
        }
    }

    /// Deserialize a required setting
    pub fn require<T: DeserializeOwned>(&self, key: &str) -> Result<T, StageError> {
        self.get(key)?.ok_or_else(|| self.missing(key))
    }

    /// Deserialize a setting, falling back to a default
    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> Result<T, StageError> {
        Ok(self.get(key)?.unwrap_or(default))
    }

    /// Fetch a reference dataset of the given kind
    pub fn dataset(&self, name: &str, kind: DatasetKind) -> Result<Arc<SharedDataset>, StageError> {
        self.resources
            .get_kind(name, kind)
            .map_err(|source| StageError::Resource {
                stage: self.name.to_string(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigFormat;
    use crate::core::resources::tests::{definitions, CountingSource};

    fn config() -> RunConfig {
        let text = r#"
            [chain]
            name = "t"
            stages = ["ref_dem"]

            [stages.ref_dem]
            dem = "dem"
            method = 3
            limits = [1.0, 2.0]
        "#;
        RunConfig::from_str_with_format(text, ConfigFormat::Toml).unwrap()
    }

    #[test]
    fn outcome_from_context_result() {
        assert_eq!(Outcome::from(Ok::<(), ContextError>(())), Outcome::Continue);
        let failed = Outcome::from(Err::<(), ContextError>(ContextError::MissingKey {
            key: "x".into(),
        }));
        assert!(matches!(failed, Outcome::Fail(m) if m.contains("'x'")));
    }

    #[test]
    fn descriptors_follow_list_order() {
        let list = StageDescriptor::list(&["a".to_string(), "b".to_string()]);
        assert_eq!(list[1], StageDescriptor { index: 1, name: "b".into() });
    }

    #[test]
    fn init_reads_typed_settings() {
        let config = config();
        let cache = SharedResourceCache::in_memory(definitions(), Arc::new(CountingSource::new()));
        let init = StageInit::new("ref_dem", &config, &cache);

        let dem: String = init.require("dem").unwrap();
        let limits: Vec<f64> = init.require("limits").unwrap();
        let absent: Option<String> = init.get("geoid").unwrap();

        assert_eq!(dem, "dem");
        assert_eq!(limits, vec![1.0, 2.0]);
        assert!(absent.is_none());
        assert!(init.get_or("skip", true).unwrap());
    }

    #[test]
    fn init_reports_missing_and_invalid_keys() {
        let config = config();
        let cache = SharedResourceCache::in_memory(definitions(), Arc::new(CountingSource::new()));
        let init = StageInit::new("ref_dem", &config, &cache);

        assert!(matches!(
            init.require::<String>("mask"),
            Err(StageError::MissingConfig { key, .. }) if key == "mask"
        ));
        assert!(matches!(
            init.require::<String>("method"),
            Err(StageError::InvalidConfig { key, .. }) if key == "method"
        ));
    }

    #[test]
    fn init_dataset_wraps_errors_with_stage_name() {
        let config = config();
        let cache = SharedResourceCache::in_memory(definitions(), Arc::new(CountingSource::new()));
        let init = StageInit::new("ref_dem", &config, &cache);

        assert!(init.dataset("dem", DatasetKind::Dem).is_ok());
        assert!(matches!(
            init.dataset("geoid", DatasetKind::Dem),
            Err(StageError::Resource { stage, .. }) if stage == "ref_dem"
        ));
    }
}
