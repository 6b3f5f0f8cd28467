//! Mask membership of each measurement.

use super::{is_south, keys, positions};
use crate::core::context::Context;
use crate::core::record::Record;
use crate::core::resources::{DatasetKind, SharedDataset};
use crate::core::stage::{Outcome, Stage, StageInit};
use crate::error::StageError;
use std::sync::Arc;

/// Tests `x_20_ku`/`y_20_ku` against the hemisphere's surface mask.
///
/// Settings: `antarctic_mask`, `greenland_mask` (at least one required),
/// `basins` (categories counted as inside, default any positive category)
/// and `skip_if_outside` (default true).
#[derive(Debug)]
pub struct SurfaceType {
    antarctic: Option<Arc<SharedDataset>>,
    greenland: Option<Arc<SharedDataset>>,
    basins: Option<Vec<i32>>,
    skip_if_outside: bool,
}

impl Default for SurfaceType {
    fn default() -> Self {
        Self {
            antarctic: None,
            greenland: None,
            basins: None,
            skip_if_outside: true,
        }
    }
}

impl SurfaceType {
    fn apply(&self, record: &dyn Record, context: &mut Context) -> Result<Outcome, String> {
        let hemisphere = context.text(keys::HEMISPHERE).map_err(|e| e.to_string())?;
        let mask = if is_south(hemisphere) {
            &self.antarctic
        } else {
            &self.greenland
        };
        let mask = mask
            .as_ref()
            .ok_or_else(|| format!("no mask configured for the {hemisphere} hemisphere"))?;

        let points = positions(record)?;
        let inside = mask.membership(&points, self.basins.as_deref());
        let count = inside.iter().filter(|flag| **flag).count();

        if count == 0 && self.skip_if_outside {
            return Ok(Outcome::skip(format!(
                "no measurements inside mask {}",
                mask.name()
            )));
        }
        tracing::debug!(
            mask = mask.name(),
            inside = count,
            percent = count as f64 * 100.0 / inside.len().max(1) as f64,
            "Classified surface"
        );

        context
            .insert(keys::IN_MASK, inside)
            .and_then(|_| context.insert(keys::NUM_IN_MASK, count))
            .map_err(|e| e.to_string())?;
        Ok(Outcome::Continue)
    }
}

impl Stage for SurfaceType {
    fn name(&self) -> &str {
        "surface_type"
    }

    fn requires(&self) -> &[&'static str] {
        &[keys::HEMISPHERE]
    }

    fn produces(&self) -> &[&'static str] {
        &[keys::IN_MASK, keys::NUM_IN_MASK]
    }

    fn initialize(&mut self, init: &StageInit<'_>) -> Result<(), StageError> {
        let antarctic: Option<String> = init.get("antarctic_mask")?;
        let greenland: Option<String> = init.get("greenland_mask")?;
        if antarctic.is_none() && greenland.is_none() {
            return Err(StageError::MissingConfig {
                stage: init.name.to_string(),
                key: "antarctic_mask".to_string(),
            });
        }
        self.basins = init.get("basins")?;
        self.skip_if_outside = init.get_or("skip_if_outside", true)?;
        self.antarctic = antarctic
            .map(|name| init.dataset(&name, DatasetKind::Mask))
            .transpose()?;
        self.greenland = greenland
            .map(|name| init.dataset(&name, DatasetKind::Mask))
            .transpose()?;
        Ok(())
    }

    fn process(&self, record: &dyn Record, context: &mut Context) -> Outcome {
        self.apply(record, context).unwrap_or_else(Outcome::Fail)
    }

    fn finalize(&mut self, stage_reached: Option<usize>) {
        tracing::debug!(?stage_reached, "surface_type finalized");
        self.antarctic = None;
        self.greenland = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::record::JsonRecord;
    use crate::core::stages::test_support;

    fn stage(settings: &str) -> SurfaceType {
        let config = test_support::config(settings);
        let cache = test_support::cache(&config);
        let mut stage = SurfaceType::default();
        stage
            .initialize(&StageInit::new("surface_type", &config, &cache))
            .unwrap();
        stage
    }

    fn south() -> Context {
        let mut context = Context::new();
        context.insert(keys::HEMISPHERE, "south").unwrap();
        context
    }

    fn record(xs: Vec<f64>, ys: Vec<f64>) -> JsonRecord {
        JsonRecord::new("p.json")
            .with_variable("x_20_ku", xs)
            .with_variable("y_20_ku", ys)
    }

    #[test]
    fn flags_points_inside_mask() {
        let stage = stage("[stages.surface_type]\nantarctic_mask = \"ant_mask\"");
        let mut context = south();

        let outcome = stage.process(&record(vec![0.0, -10.0], vec![0.0, 10.0]), &mut context);

        assert_eq!(outcome, Outcome::Continue);
        assert_eq!(context.flags(keys::IN_MASK).unwrap(), &[true, false]);
        assert_eq!(context.int(keys::NUM_IN_MASK).unwrap(), 1);
    }

    #[test]
    fn pass_entirely_outside_is_skipped() {
        let stage = stage("[stages.surface_type]\nantarctic_mask = \"ant_mask\"");
        let outcome = stage.process(&record(vec![-10.0], vec![10.0]), &mut south());
        assert!(matches!(outcome, Outcome::Skip(_)));
    }

    #[test]
    fn outside_pass_continues_when_skip_disabled() {
        let stage = stage(
            "[stages.surface_type]\nantarctic_mask = \"ant_mask\"\nskip_if_outside = false",
        );
        let mut context = south();

        let outcome = stage.process(&record(vec![-10.0], vec![10.0]), &mut context);

        assert_eq!(outcome, Outcome::Continue);
        assert_eq!(context.int(keys::NUM_IN_MASK).unwrap(), 0);
    }

    #[test]
    fn basins_restrict_membership() {
        let stage = stage(
            "[stages.surface_type]\nantarctic_mask = \"ant_mask\"\nbasins = [3]",
        );
        let mut context = south();

        stage.process(&record(vec![0.0, 10.0], vec![0.0, -10.0]), &mut context);

        assert_eq!(context.flags(keys::IN_MASK).unwrap(), &[false, true]);
    }
}
