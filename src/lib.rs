//! # Altimetry Chain
//!
//! Runs a configurable chain of processing stages over batches of
//! satellite radar altimetry files.
//!
//! ## Model
//! - A **chain** is an ordered list of named stages from the registry
//! - Each input file gets a fresh context; stages read and write keys in it
//! - A stage ends a file early by skipping it (not an error) or failing it
//! - Files run in-process in list order, or across worker processes that
//!   share read-only reference datasets through memory-mapped segments
//!
//! ## Architecture
//! - `config` - TOML/JSON run configuration
//! - `core` - the engine: stages, resources, finder, pipeline
//! - `events` - progress events for front ends
//! - `error` - error types
//! - `cli` - the `run-chain` binary (not part of the library)

pub mod config;
pub mod core;
pub mod error;
pub mod events;

// Re-export commonly used types at the crate root
pub use config::RunConfig;
pub use error::{ChainError, Result};

use config::LogSettings;
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber, writing to stderr.
///
/// `RUST_LOG` wins over the configured level; `quiet` raises the default
/// to `warn`.
pub fn init_tracing(settings: &LogSettings, ansi: bool) -> Result<()> {
    let default_level = if settings.quiet {
        "warn"
    } else {
        settings.level.as_str()
    };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| ChainError::Logging(e.to_string()))?;

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(ansi)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| ChainError::Logging(e.to_string()))
}
