//! Reference DEM elevation under each measurement.

use super::{is_south, keys, positions};
use crate::core::context::Context;
use crate::core::record::Record;
use crate::core::resources::{DatasetKind, Interpolation, SharedDataset};
use crate::core::stage::{Outcome, Stage, StageInit};
use crate::error::StageError;
use std::sync::Arc;

/// Interpolates the hemisphere's DEM at `x_20_ku`/`y_20_ku`.
///
/// Settings: `antarctic_dem`, `greenland_dem` (dataset names, at least one
/// required) and `method` (`linear` or `nearest`).
#[derive(Debug, Default)]
pub struct RefDem {
    antarctic: Option<Arc<SharedDataset>>,
    greenland: Option<Arc<SharedDataset>>,
    method: Interpolation,
}

impl RefDem {
    fn apply(&self, record: &dyn Record, context: &mut Context) -> Result<Outcome, String> {
        let hemisphere = context.text(keys::HEMISPHERE).map_err(|e| e.to_string())?;
        let dem = if is_south(hemisphere) {
            &self.antarctic
        } else {
            &self.greenland
        };
        let dem = dem
            .as_ref()
            .ok_or_else(|| format!("no DEM configured for the {hemisphere} hemisphere"))?;

        let points = positions(record)?;
        let values = dem.interpolate(&points, self.method);
        tracing::debug!(
            dem = dem.name(),
            valid = values.iter().filter(|v| v.is_finite()).count(),
            total = values.len(),
            "Interpolated reference DEM"
        );

        context
            .insert(keys::DEM_ELEVATION_VALUES, values)
            .map_err(|e| e.to_string())?;
        Ok(Outcome::Continue)
    }
}

impl Stage for RefDem {
    fn name(&self) -> &str {
        "ref_dem"
    }

    fn requires(&self) -> &[&'static str] {
        &[keys::HEMISPHERE]
    }

    fn produces(&self) -> &[&'static str] {
        &[keys::DEM_ELEVATION_VALUES]
    }

    fn initialize(&mut self, init: &StageInit<'_>) -> Result<(), StageError> {
        let antarctic: Option<String> = init.get("antarctic_dem")?;
        let greenland: Option<String> = init.get("greenland_dem")?;
        if antarctic.is_none() && greenland.is_none() {
            return Err(StageError::MissingConfig {
                stage: init.name.to_string(),
                key: "antarctic_dem".to_string(),
            });
        }
        self.method = init.get_or("method", Interpolation::Linear)?;
        self.antarctic = antarctic
            .map(|name| init.dataset(&name, DatasetKind::Dem))
            .transpose()?;
        self.greenland = greenland
            .map(|name| init.dataset(&name, DatasetKind::Dem))
            .transpose()?;
        Ok(())
    }

    fn process(&self, record: &dyn Record, context: &mut Context) -> Outcome {
        self.apply(record, context).unwrap_or_else(Outcome::Fail)
    }

    fn finalize(&mut self, stage_reached: Option<usize>) {
        tracing::debug!(?stage_reached, "ref_dem finalized");
        self.antarctic = None;
        self.greenland = None;
    }
}
