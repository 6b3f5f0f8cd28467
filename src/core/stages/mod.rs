//! # Stages Module
//!
//! Built-in processing stages.
//!
//! ## CryoTEMPO land ice chain
//! - `identify_file` - instrument mode, 20 Hz record count, hemisphere
//! - `skip_on_mode` - skips files acquired in unwanted modes (SAR by default)
//! - `ref_dem` - reference DEM elevation under each measurement
//! - `surface_type` - mask membership of each measurement
//! - `filter_height` - invalidates heights far from the DEM or out of range
//!
//! ## Test chain
//! - `test_alg1`, `test_alg2` - trivial stages for exercising the engine
//! - `fault_injector` - skips, fails or aborts the process on demand
//!
//! Records are expected to carry measurement positions already projected
//! into the grids' coordinate system (`x_20_ku`, `y_20_ku`).

mod filter_height;
mod identify;
mod ref_dem;
mod skip_on_mode;
mod surface_type;
mod testchain;

pub use filter_height::FilterHeight;
pub use identify::IdentifyFile;
pub use ref_dem::RefDem;
pub use skip_on_mode::SkipOnMode;
pub use surface_type::SurfaceType;
pub use testchain::{FaultInjector, TestAlg1, TestAlg2};

use crate::core::record::Record;
use crate::core::resources::Point;
use crate::core::stage::StageRegistry;

/// Context keys written by the built-in stages
pub mod keys {
    pub const INSTR_MODE: &str = "instr_mode";
    pub const NUM_20HZ_RECORDS: &str = "num_20hz_records";
    pub const HEMISPHERE: &str = "hemisphere";
    pub const DEM_ELEVATION_VALUES: &str = "dem_elevation_values";
    pub const IN_MASK: &str = "in_mask";
    pub const NUM_IN_MASK: &str = "num_in_mask";
    pub const HEIGHT_FILT: &str = "height_filt";
}

/// Add every built-in stage to a registry
pub fn register_builtin(registry: &mut StageRegistry) {
    registry
        .register("identify_file", || Box::new(IdentifyFile))
        .register("skip_on_mode", || Box::new(SkipOnMode::default()))
        .register("ref_dem", || Box::new(RefDem::default()))
        .register("surface_type", || Box::new(SurfaceType::default()))
        .register("filter_height", || Box::new(FilterHeight::default()))
        .register("test_alg1", || Box::new(TestAlg1))
        .register("test_alg2", || Box::new(TestAlg2))
        .register("fault_injector", || Box::new(FaultInjector));
}

fn variable<'r>(record: &'r dyn Record, name: &str) -> Result<&'r [f64], String> {
    record
        .variable(name)
        .ok_or_else(|| format!("{name} not found in {}", record.path().display()))
}

/// Projected measurement positions of a record
fn positions(record: &dyn Record) -> Result<Vec<Point>, String> {
    let xs = variable(record, "x_20_ku")?;
    let ys = variable(record, "y_20_ku")?;
    if xs.len() != ys.len() {
        return Err(format!(
            "x_20_ku has {} values but y_20_ku has {}",
            xs.len(),
            ys.len()
        ));
    }
    Ok(Point::zip(xs, ys))
}

/// Hemisphere names as written by `identify_file`
fn is_south(hemisphere: &str) -> bool {
    hemisphere == "south"
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::config::{ConfigFormat, DatasetDefinition, RunConfig};
    use crate::core::resources::{
        DatasetKind, DatasetSource, GridData, GridMeta, SharedResourceCache,
    };
    use crate::error::DatasetError;
    use std::sync::Arc;

    /// 3x3 grids centred on the origin with 10 m cells
    pub struct FixedSource;

    impl DatasetSource for FixedSource {
        fn load(&self, name: &str, definition: &DatasetDefinition) -> Result<GridData, DatasetError> {
            let values = match definition.kind {
                DatasetKind::Dem => vec![100.0, 110.0, 120.0, 130.0, 140.0, 150.0, 160.0, 170.0, 180.0],
                DatasetKind::Mask => vec![0.0, 1.0, 1.0, 0.0, 2.0, 2.0, 0.0, 0.0, 3.0],
            };
            Ok(GridData {
                meta: GridMeta {
                    name: name.to_string(),
                    kind: definition.kind,
                    projection: "EPSG:3031".to_string(),
                    rows: 3,
                    cols: 3,
                    x_min: -10.0,
                    y_max: 10.0,
                    resolution: 10.0,
                    nodata: None,
                    basin_scheme: None,
                },
                values,
            })
        }
    }

    pub fn config(stages_toml: &str) -> RunConfig {
        let text = format!(
            r#"
            [chain]
            name = "test"
            stages = ["identify_file"]

            [datasets.ant_dem]
            kind = "dem"
            path = "/unused/ant_dem.json"

            [datasets.ant_mask]
            kind = "mask"
            path = "/unused/ant_mask.json"

            {stages_toml}
            "#
        );
        RunConfig::from_str_with_format(&text, ConfigFormat::Toml).unwrap()
    }

    pub fn cache(config: &RunConfig) -> SharedResourceCache {
        SharedResourceCache::in_memory(config.datasets.clone(), Arc::new(FixedSource))
    }
}
