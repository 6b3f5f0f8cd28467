//! Directory walking implementation using walkdir.

use super::{filter::L1bFilter, FileSelector, InstrumentMode};
use crate::config::FinderSettings;
use crate::error::FinderError;
use std::path::PathBuf;
use walkdir::WalkDir;

/// Configuration for the L1b finder
#[derive(Debug, Clone)]
pub struct FinderConfig {
    /// Directory to search
    pub base_dir: PathBuf,
    /// Only look at the base directory itself
    pub flat: bool,
    /// Whether to follow symbolic links
    pub follow_symlinks: bool,
    /// Keep at most this many files (after sorting)
    pub max_files: Option<usize>,
}

/// Finder walking a directory tree for L1b files
pub struct L1bFinder {
    config: FinderConfig,
    filter: L1bFilter,
}

impl L1bFinder {
    /// Create a finder with the given configuration and filter
    pub fn new(config: FinderConfig, filter: L1bFilter) -> Self {
        Self { config, filter }
    }

    /// Build a finder from the `[finder]` config section
    pub fn from_settings(settings: &FinderSettings) -> Result<Self, FinderError> {
        let base_dir = settings.base_dir.clone().ok_or_else(|| {
            FinderError::InvalidCriteria("finder.base_dir is not set".to_string())
        })?;
        let modes = settings
            .modes
            .iter()
            .map(|m| m.parse::<InstrumentMode>())
            .collect::<Result<Vec<_>, _>>()?;

        let filter = L1bFilter::new(&settings.extensions)
            .with_years(settings.years.clone())
            .with_months(settings.months.clone())
            .with_baselines(&settings.baselines)
            .with_modes(modes);
        let config = FinderConfig {
            base_dir,
            flat: settings.flat,
            follow_symlinks: false,
            max_files: settings.max_files,
        };
        Ok(Self::new(config, filter))
    }
}

impl FileSelector for L1bFinder {
    fn select(&self) -> Result<Vec<PathBuf>, FinderError> {
        let root = &self.config.base_dir;
        if !root.is_dir() {
            return Err(FinderError::BasePathNotFound { path: root.clone() });
        }

        let mut walker = WalkDir::new(root).follow_links(self.config.follow_symlinks);
        if self.config.flat {
            walker = walker.max_depth(1);
        }

        let mut files = Vec::new();
        for entry_result in walker {
            let entry = entry_result.map_err(|e| {
                let path = e.path().map(|p| p.to_path_buf()).unwrap_or_else(|| root.clone());
                FinderError::ReadDirectory {
                    path,
                    source: std::io::Error::other(e.to_string()),
                }
            })?;
            if entry.file_type().is_dir() {
                continue;
            }
            if self.filter.should_include(entry.path()) {
                files.push(entry.into_path());
            }
        }

        files.sort();
        if let Some(max) = self.config.max_files {
            files.truncate(max);
        }
        tracing::info!(base_dir = %root.display(), found = files.len(), "Selected input files");
        Ok(files)
    }
}
