//! Invalidates heights far from the reference DEM or out of range.

use super::{is_south, keys, variable};
use crate::core::context::Context;
use crate::core::record::Record;
use crate::core::stage::{Outcome, Stage, StageInit};
use crate::error::StageError;
use serde::Deserialize;

/// `[stages.filter_height.height_filters]`
#[derive(Debug, Clone, Deserialize)]
pub struct HeightFilters {
    #[serde(default)]
    pub max_diff_to_ref_dem: Option<f64>,
    #[serde(default)]
    pub max_diff_to_ref_dem_lrm: Option<f64>,
    #[serde(default)]
    pub max_diff_to_ref_dem_sin: Option<f64>,
    pub min_elevation_antarctica: f64,
    pub max_elevation_antarctica: f64,
    pub min_elevation_greenland: f64,
    pub max_elevation_greenland: f64,
}

impl HeightFilters {
    /// Largest allowed |height - DEM|; mode specific values win
    fn max_diff(&self, mode: &str) -> Option<f64> {
        let specific = match mode {
            "LRM" => self.max_diff_to_ref_dem_lrm,
            "SIN" => self.max_diff_to_ref_dem_sin,
            _ => None,
        };
        specific.or(self.max_diff_to_ref_dem)
    }

    fn limits(&self, south: bool) -> (f64, f64) {
        if south {
            (self.min_elevation_antarctica, self.max_elevation_antarctica)
        } else {
            (self.min_elevation_greenland, self.max_elevation_greenland)
        }
    }
}

/// Writes `height_filt`: `height_20_ku` with outliers set to NaN
#[derive(Debug, Default)]
pub struct FilterHeight {
    filters: Option<HeightFilters>,
}

impl FilterHeight {
    fn filtered(&self, record: &dyn Record, context: &Context) -> Result<Vec<f64>, String> {
        let filters = self
            .filters
            .as_ref()
            .ok_or_else(|| "filter_height was not initialized".to_string())?;
        let mode = context.text(keys::INSTR_MODE).map_err(|e| e.to_string())?;
        let hemisphere = context.text(keys::HEMISPHERE).map_err(|e| e.to_string())?;
        let dem = context
            .floats(keys::DEM_ELEVATION_VALUES)
            .map_err(|e| e.to_string())?;
        let heights = variable(record, "height_20_ku")?;
        if heights.len() != dem.len() {
            return Err(format!(
                "height_20_ku has {} values but dem_elevation_values has {}",
                heights.len(),
                dem.len()
            ));
        }

        let max_diff = filters
            .max_diff(mode)
            .ok_or_else(|| format!("no max_diff_to_ref_dem for {mode} mode"))?;
        let (min, max) = filters.limits(is_south(hemisphere));

        let filtered: Vec<f64> = heights
            .iter()
            .zip(dem)
            .map(|(&h, &d)| {
                if (h - d).abs() > max_diff || h > max || h < min {
                    f64::NAN
                } else {
                    h
                }
            })
            .collect();

        tracing::debug!(
            removed = filtered.iter().filter(|v| v.is_nan()).count(),
            max_diff,
            min,
            max,
            "Filtered heights"
        );
        Ok(filtered)
    }
}

impl Stage for FilterHeight {
    fn name(&self) -> &str {
        "filter_height"
    }

    fn requires(&self) -> &[&'static str] {
        &[keys::INSTR_MODE, keys::HEMISPHERE, keys::DEM_ELEVATION_VALUES]
    }

    fn produces(&self) -> &[&'static str] {
        &[keys::HEIGHT_FILT]
    }

    fn initialize(&mut self, init: &StageInit<'_>) -> Result<(), StageError> {
        let filters: HeightFilters = init.require("height_filters")?;
        if filters.max_diff_to_ref_dem.is_none()
            && filters.max_diff_to_ref_dem_lrm.is_none()
            && filters.max_diff_to_ref_dem_sin.is_none()
        {
            return Err(StageError::MissingConfig {
                stage: init.name.to_string(),
                key: "height_filters.max_diff_to_ref_dem".to_string(),
            });
        }
        self.filters = Some(filters);
        Ok(())
    }

    fn process(&self, record: &dyn Record, context: &mut Context) -> Outcome {
        match self.filtered(record, context) {
            Ok(filtered) => context.insert(keys::HEIGHT_FILT, filtered).into(),
            Err(reason) => Outcome::Fail(reason),
        }
    }
}
