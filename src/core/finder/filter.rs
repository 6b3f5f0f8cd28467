//! L1b file name parsing and selection criteria.

use super::InstrumentMode;
use chrono::{Datelike, NaiveDateTime};
use regex::Regex;
use std::collections::HashSet;
use std::path::Path;
use std::sync::OnceLock;

/// Fields parsed from a CryoSat-2 L1b file name, e.g.
/// `CS_OFFL_SIR_SIN_1B_20200101T003125_20200101T003324_D001.nc`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct L1bName {
    /// File class, e.g. "OFFL" or "NRT_"
    pub class: String,
    pub mode: InstrumentMode,
    pub start: NaiveDateTime,
    pub stop: NaiveDateTime,
    /// Processing baseline letter
    pub baseline: char,
    pub version: u16,
}

impl L1bName {
    /// Parse a file name (not a full path). None if it is not an L1b name.
    pub fn parse(file_name: &str) -> Option<Self> {
        static PATTERN: OnceLock<Regex> = OnceLock::new();
        let pattern = PATTERN.get_or_init(|| {
            Regex::new(
                r"^CS_([A-Z_]{4})_SIR_(SIN|LRM|SAR)_1B_(\d{8}T\d{6})_(\d{8}T\d{6})_([A-Z])(\d{3})\.\w+$",
            )
            .expect("L1b name pattern is valid")
        });

        let caps = pattern.captures(file_name)?;
        let time = |i: usize| NaiveDateTime::parse_from_str(&caps[i], "%Y%m%dT%H%M%S").ok();
        Some(Self {
            class: caps[1].to_string(),
            mode: caps[2].parse().ok()?,
            start: time(3)?,
            stop: time(4)?,
            baseline: caps[5].chars().next()?,
            version: caps[6].parse().ok()?,
        })
    }

    /// Parse the final component of a path
    pub fn from_path(path: &Path) -> Option<Self> {
        path.file_name().and_then(|n| n.to_str()).and_then(Self::parse)
    }
}

/// Decides which walked files are selected
#[derive(Debug, Clone)]
pub struct L1bFilter {
    extensions: HashSet<String>,
    years: Vec<i32>,
    months: Vec<u32>,
    baselines: Vec<char>,
    modes: Vec<InstrumentMode>,
    include_hidden: bool,
}

impl L1bFilter {
    /// Accept any file with one of the given extensions
    pub fn new(extensions: &[String]) -> Self {
        Self {
            extensions: extensions.iter().map(|e| e.to_lowercase()).collect(),
            years: Vec::new(),
            months: Vec::new(),
            baselines: Vec::new(),
            modes: Vec::new(),
            include_hidden: false,
        }
    }

    pub fn with_years(mut self, years: Vec<i32>) -> Self {
        self.years = years;
        self
    }

    pub fn with_months(mut self, months: Vec<u32>) -> Self {
        self.months = months;
        self
    }

    /// Baseline letters, e.g. "DE"
    pub fn with_baselines(mut self, baselines: &str) -> Self {
        self.baselines = baselines.chars().collect();
        self
    }

    pub fn with_modes(mut self, modes: Vec<InstrumentMode>) -> Self {
        self.modes = modes;
        self
    }

    pub fn with_hidden(mut self, include: bool) -> Self {
        self.include_hidden = include;
        self
    }

    /// Whether any criterion needs a parsed L1b name
    fn needs_name(&self) -> bool {
        !(self.years.is_empty()
            && self.months.is_empty()
            && self.baselines.is_empty()
            && self.modes.is_empty())
    }

    /// Check if a file should be selected. Files without an L1b name are
    /// only selected when no name-based criterion is set.
    pub fn should_include(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        if !self.include_hidden && name.starts_with('.') {
            return false;
        }
        let extension_ok = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| self.extensions.contains(&e.to_lowercase()))
            .unwrap_or(false);
        if !extension_ok {
            return false;
        }
        if !self.needs_name() {
            return true;
        }

        let Some(l1b) = L1bName::parse(name) else {
            return false;
        };
        (self.years.is_empty() || self.years.contains(&l1b.start.year()))
            && (self.months.is_empty() || self.months.contains(&l1b.start.month()))
            && (self.baselines.is_empty() || self.baselines.contains(&l1b.baseline))
            && (self.modes.is_empty() || self.modes.contains(&l1b.mode))
    }
}
