//! # Config Module
//!
//! Run configuration for a chain invocation.
//!
//! ## Sections
//! - `[chain]` - stage list and execution flags
//! - `[finder]` - input file selection criteria
//! - `[datasets.<name>]` - shared reference grids (DEMs, masks)
//! - `[stages.<name>]` - free-form settings handed to each stage's `initialize`
//! - `[logging]` - log level and worker log directory
//! - `[shared_memory]` - where shared dataset segments live
//!
//! ## Example
//! ```toml
//! [chain]
//! name = "cryotempo"
//! stages = ["identify_file", "skip_on_mode", "ref_dem"]
//! use_multi_processing = true
//! use_shared_memory = true
//!
//! [datasets.rema_ant_1km]
//! kind = "dem"
//! path = "/data/dems/rema_ant_1km.json"
//!
//! [stages.ref_dem]
//! dem = "rema_ant_1km"
//! ```

use crate::core::resources::DatasetKind;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Complete configuration for one chain run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Chain-level execution settings
    pub chain: ChainSettings,
    /// Input file selection
    #[serde(default)]
    pub finder: FinderSettings,
    /// Shared reference datasets, keyed by dataset name
    #[serde(default)]
    pub datasets: BTreeMap<String, DatasetDefinition>,
    /// Per-stage settings sub-trees, keyed by stage name
    #[serde(default)]
    pub stages: BTreeMap<String, serde_json::Value>,
    /// Logging settings
    #[serde(default)]
    pub logging: LogSettings,
    /// Shared memory settings
    #[serde(default)]
    pub shared_memory: SharedMemorySettings,
}

/// Chain-level execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainSettings {
    /// Chain name, used in log output
    pub name: String,
    /// Ordered stage names
    pub stages: Vec<String>,
    /// Stop dispatching files after the first stage failure
    #[serde(default)]
    pub stop_on_error: bool,
    /// Report the run as failed when any file failed
    #[serde(default = "default_true")]
    pub fail_on_errors: bool,
    /// Distribute files across worker processes
    #[serde(default)]
    pub use_multi_processing: bool,
    /// Upper bound on worker processes (None = available cores)
    #[serde(default)]
    pub max_processes: Option<usize>,
    /// Publish datasets through shared memory in multi-processing mode
    #[serde(default)]
    pub use_shared_memory: bool,
}

impl ChainSettings {
    /// Number of worker processes allowed for this run
    pub fn worker_limit(&self) -> usize {
        self.max_processes.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }
}

/// Input file selection criteria
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinderSettings {
    /// Directory searched for input files
    #[serde(default)]
    pub base_dir: Option<PathBuf>,
    /// Accepted acquisition years (empty = any)
    #[serde(default)]
    pub years: Vec<i32>,
    /// Accepted acquisition months 1-12 (empty = any)
    #[serde(default)]
    pub months: Vec<u32>,
    /// Accepted baseline letters, e.g. "DE" (empty = any)
    #[serde(default)]
    pub baselines: String,
    /// Accepted instrument modes, e.g. ["SIN", "LRM"] (empty = any)
    #[serde(default)]
    pub modes: Vec<String>,
    /// Accepted file extensions
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    /// Only search the base directory itself
    #[serde(default)]
    pub flat: bool,
    /// Keep at most this many files
    #[serde(default)]
    pub max_files: Option<usize>,
}

impl Default for FinderSettings {
    fn default() -> Self {
        Self {
            base_dir: None,
            years: Vec::new(),
            months: Vec::new(),
            baselines: String::new(),
            modes: Vec::new(),
            extensions: default_extensions(),
            flat: false,
            max_files: None,
        }
    }
}

/// Definition of a shared reference dataset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetDefinition {
    /// Whether the grid holds elevations or mask categories
    pub kind: DatasetKind,
    /// Path of the dataset header
    pub path: PathBuf,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    /// Default level when RUST_LOG is unset
    #[serde(default = "default_level")]
    pub level: String,
    /// Directory receiving per-worker log files
    #[serde(default)]
    pub dir: Option<PathBuf>,
    /// Only report warnings and errors
    #[serde(default)]
    pub quiet: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            dir: None,
            quiet: false,
        }
    }
}

/// Shared memory settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedMemorySettings {
    /// Directory holding segments (None = /dev/shm, or the temp dir)
    #[serde(default)]
    pub dir: Option<PathBuf>,
    /// Per-run namespace, assigned by the orchestrator
    #[serde(default)]
    pub namespace: Option<String>,
    /// How long to wait for another process to publish a dataset
    #[serde(default = "default_publish_timeout")]
    pub publish_timeout_secs: u64,
}

impl Default for SharedMemorySettings {
    fn default() -> Self {
        Self {
            dir: None,
            namespace: None,
            publish_timeout_secs: default_publish_timeout(),
        }
    }
}

impl SharedMemorySettings {
    /// Root directory for segments on this host
    pub fn root_dir(&self) -> PathBuf {
        if let Some(dir) = &self.dir {
            return dir.clone();
        }
        let shm = Path::new("/dev/shm");
        if shm.is_dir() {
            shm.to_path_buf()
        } else {
            std::env::temp_dir()
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_extensions() -> Vec<String> {
    vec!["json".to_string()]
}

fn default_level() -> String {
    "info".to_string()
}

fn default_publish_timeout() -> u64 {
    300
}

/// Supported configuration file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Json,
}

impl RunConfig {
    /// Load configuration from a file, picking the format from its extension
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound {
                path: path.to_path_buf(),
            });
        }
        let format = Self::detect_format(path)?;
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_str_with_format(&content, format)
    }

    /// Parse and validate configuration text
    pub fn from_str_with_format(content: &str, format: ConfigFormat) -> Result<Self, ConfigError> {
        let config: RunConfig = match format {
            ConfigFormat::Toml => toml::from_str(content).map_err(|e| ConfigError::Parse {
                reason: e.to_string(),
            })?,
            ConfigFormat::Json => {
                serde_json::from_str(content).map_err(|e| ConfigError::Parse {
                    reason: e.to_string(),
                })?
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Default location of the main config file
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("altimetry-chain")
            .join("config.toml")
    }

    /// Settings sub-tree for a stage (an empty table if none was given)
    pub fn stage_settings(&self, stage: &str) -> &serde_json::Value {
        static EMPTY: serde_json::Value = serde_json::Value::Null;
        self.stages.get(stage).unwrap_or(&EMPTY)
    }

    /// Check invariants serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chain.stages.is_empty() {
            return Err(ConfigError::Invalid(
                "chain.stages must name at least one stage".to_string(),
            ));
        }
        if self.chain.max_processes == Some(0) {
            return Err(ConfigError::Invalid(
                "chain.max_processes must be at least 1".to_string(),
            ));
        }
        if let Some(month) = self.finder.months.iter().find(|m| !(1..=12).contains(*m)) {
            return Err(ConfigError::Invalid(format!(
                "finder.months contains {month}, months must be 1-12"
            )));
        }
        if let Some(year) = self.finder.years.iter().find(|y| **y < 1960) {
            return Err(ConfigError::Invalid(format!(
                "finder.years contains {year}, years must be >= 1960"
            )));
        }
        if !self.finder.baselines.chars().all(|c| c.is_ascii_uppercase()) {
            return Err(ConfigError::Invalid(format!(
                "finder.baselines '{}' must only contain letters A-Z",
                self.finder.baselines
            )));
        }
        Ok(())
    }

    fn detect_format(path: &Path) -> Result<ConfigFormat, ConfigError> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_lowercase();
        match extension.as_str() {
            "toml" => Ok(ConfigFormat::Toml),
            "json" => Ok(ConfigFormat::Json),
            _ => Err(ConfigError::UnsupportedFormat { extension }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [chain]
        name = "testchain"
        stages = ["test_alg1", "test_alg2"]
    "#;

    #[test]
    fn minimal_toml_uses_defaults() {
        let config = RunConfig::from_str_with_format(MINIMAL, ConfigFormat::Toml).unwrap();

        assert_eq!(config.chain.stages, vec!["test_alg1", "test_alg2"]);
        assert!(!config.chain.stop_on_error);
        assert!(config.chain.fail_on_errors);
        assert!(!config.chain.use_multi_processing);
        assert_eq!(config.finder.extensions, vec!["json"]);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.shared_memory.publish_timeout_secs, 300);
    }

    #[test]
    fn stage_sub_trees_are_kept_as_json() {
        let text = format!(
            "{MINIMAL}\n[stages.filter_height]\nmax_diff_to_ref_dem = 50.0\nmodes = [\"SIN\"]\n"
        );
        let config = RunConfig::from_str_with_format(&text, ConfigFormat::Toml).unwrap();

        let settings = config.stage_settings("filter_height");
        assert_eq!(settings["max_diff_to_ref_dem"], serde_json::json!(50.0));
        assert_eq!(settings["modes"][0], "SIN");
        assert!(config.stage_settings("missing").is_null());
    }

    #[test]
    fn datasets_section_parses_kind() {
        let text = format!(
            "{MINIMAL}\n[datasets.rema]\nkind = \"dem\"\npath = \"/data/rema.json\"\n"
        );
        let config = RunConfig::from_str_with_format(&text, ConfigFormat::Toml).unwrap();

        assert_eq!(config.datasets["rema"].kind, DatasetKind::Dem);
    }

    #[test]
    fn empty_stage_list_is_rejected() {
        let text = "[chain]\nname = \"x\"\nstages = []\n";
        let result = RunConfig::from_str_with_format(text, ConfigFormat::Toml);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn invalid_month_is_rejected() {
        let text = format!("{MINIMAL}\n[finder]\nmonths = [13]\n");
        let result = RunConfig::from_str_with_format(&text, ConfigFormat::Toml);
        assert!(matches!(result, Err(ConfigError::Invalid(m)) if m.contains("13")));
    }

    #[test]
    fn lowercase_baseline_is_rejected() {
        let text = format!("{MINIMAL}\n[finder]\nbaselines = \"de\"\n");
        assert!(RunConfig::from_str_with_format(&text, ConfigFormat::Toml).is_err());
    }

    #[test]
    fn config_survives_json_round_trip_for_workers() {
        let text = format!("{MINIMAL}\n[stages.test_alg1]\nflag = true\n");
        let config = RunConfig::from_str_with_format(&text, ConfigFormat::Toml).unwrap();

        let json = serde_json::to_string(&config).unwrap();
        let restored = RunConfig::from_str_with_format(&json, ConfigFormat::Json).unwrap();

        assert_eq!(restored.stage_settings("test_alg1")["flag"], true);
    }

    #[test]
    fn load_rejects_unknown_extension() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("chain.yml");
        std::fs::write(&path, MINIMAL).unwrap();

        let result = RunConfig::load(&path);
        assert!(matches!(result, Err(ConfigError::UnsupportedFormat { .. })));
    }

    #[test]
    fn load_reports_missing_file() {
        let result = RunConfig::load(Path::new("/nonexistent/chain.toml"));
        assert!(matches!(result, Err(ConfigError::NotFound { .. })));
    }

    #[test]
    fn worker_limit_honours_max_processes() {
        let mut config = RunConfig::from_str_with_format(MINIMAL, ConfigFormat::Toml).unwrap();
        config.chain.max_processes = Some(3);
        assert_eq!(config.chain.worker_limit(), 3);
    }
}
