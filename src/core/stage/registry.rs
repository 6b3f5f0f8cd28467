//! Name to factory mapping for stages.

use super::Stage;
use crate::core::context::{FILE_INDEX_KEY, FILE_NAME_KEY};
use crate::error::ConfigError;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Creates a fresh stage instance
pub type StageFactory = Arc<dyn Fn() -> Box<dyn Stage> + Send + Sync>;

/// Summary of a registered stage, for listings
#[derive(Debug, Clone, Serialize)]
pub struct StageInfo {
    pub name: String,
    pub requires: Vec<String>,
    pub produces: Vec<String>,
}

/// Stage factories keyed by name
#[derive(Clone, Default)]
pub struct StageRegistry {
    factories: BTreeMap<String, StageFactory>,
}

impl StageRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in stage
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        crate::core::stages::register_builtin(&mut registry);
        registry
    }

    /// The process-wide built-in registry. Worker processes build their
    /// stages from this one.
    pub fn global() -> &'static StageRegistry {
        static REGISTRY: OnceLock<StageRegistry> = OnceLock::new();
        REGISTRY.get_or_init(StageRegistry::builtin)
    }

    /// Register a factory, replacing any previous one with the same name
    pub fn register<F>(&mut self, name: &str, factory: F) -> &mut Self
    where
        F: Fn() -> Box<dyn Stage> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Arc::new(factory));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names in sorted order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Instantiate a stage by name
    pub fn create(&self, name: &str) -> Result<Box<dyn Stage>, ConfigError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| ConfigError::UnknownStage {
                name: name.to_string(),
            })?;
        Ok(factory())
    }

    /// Instantiate a stage list in order and check its key schema
    pub fn build_chain(&self, names: &[String]) -> Result<Vec<Box<dyn Stage>>, ConfigError> {
        let stages = names
            .iter()
            .map(|name| self.create(name))
            .collect::<Result<Vec<_>, _>>()?;
        check_schema(&stages)?;
        Ok(stages)
    }

    /// Describe every registered stage
    pub fn describe(&self) -> Vec<StageInfo> {
        self.factories
            .iter()
            .map(|(name, factory)| {
                let stage = factory();
                StageInfo {
                    name: name.clone(),
                    requires: stage.requires().iter().map(|k| k.to_string()).collect(),
                    produces: stage.produces().iter().map(|k| k.to_string()).collect(),
                }
            })
            .collect()
    }
}

impl fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.factories.keys()).finish()
    }
}

/// Fail if a stage reads a key that no earlier stage writes
pub fn check_schema(stages: &[Box<dyn Stage>]) -> Result<(), ConfigError> {
    let mut available: HashSet<&str> = [FILE_NAME_KEY, FILE_INDEX_KEY].into_iter().collect();
    for stage in stages {
        if let Some(key) = stage.requires().iter().find(|k| !available.contains(**k)) {
            return Err(ConfigError::SchemaViolation {
                stage: stage.name().to_string(),
                key: key.to_string(),
            });
        }
        available.extend(stage.produces().iter().copied());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::context::Context;
    use crate::core::record::Record;
    use crate::core::stage::Outcome;

    struct Keyed {
        name: &'static str,
        requires: &'static [&'static str],
        produces: &'static [&'static str],
    }

    impl Stage for Keyed {
        fn name(&self) -> &str {
            self.name
        }
        fn requires(&self) -> &[&'static str] {
            self.requires
        }
        fn produces(&self) -> &[&'static str] {
            self.produces
        }
        fn process(&self, _record: &dyn Record, _context: &mut Context) -> Outcome {
            Outcome::Continue
        }
    }

    fn registry() -> StageRegistry {
        let mut registry = StageRegistry::new();
        registry
            .register("classify", || {
                Box::new(Keyed { name: "classify", requires: &["file_name"], produces: &["mode"] })
            })
            .register("retrack", || {
                Box::new(Keyed { name: "retrack", requires: &["mode"], produces: &["range"] })
            });
        registry
    }

    #[test]
    fn unknown_name_is_a_config_error() {
        let result = registry().create("geolocate");
        assert!(matches!(result, Err(ConfigError::UnknownStage { name }) if name == "geolocate"));
    }

    #[test]
    fn chain_in_dependency_order_builds() {
        let chain = registry()
            .build_chain(&["classify".to_string(), "retrack".to_string()])
            .unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[1].name(), "retrack");
    }

    #[test]
    fn chain_reading_unproduced_key_fails_fast() {
        let result = registry().build_chain(&["retrack".to_string(), "classify".to_string()]);
        assert!(matches!(
            result,
            Err(ConfigError::SchemaViolation { stage, key }) if stage == "retrack" && key == "mode"
        ));
    }

    #[test]
    fn describe_lists_schema() {
        let info = registry().describe();
        assert_eq!(info[0].name, "classify");
        assert_eq!(info[0].produces, vec!["mode"]);
    }

    #[test]
    fn global_registry_has_builtin_stages() {
        let global = StageRegistry::global();
        for name in ["identify_file", "skip_on_mode", "ref_dem", "surface_type", "filter_height"] {
            assert!(global.contains(name), "missing {name}");
        }
        assert!(global.contains("test_alg1"));
    }

    #[test]
    fn builtin_registry_schema_is_consistent() {
        let chain: Vec<String> = ["identify_file", "skip_on_mode", "ref_dem", "surface_type", "filter_height"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert!(StageRegistry::builtin().build_chain(&chain).is_ok());
    }
}
