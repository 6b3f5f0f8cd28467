//! Fixtures shared by the integration tests.

#![allow(dead_code)]

use altimetry_chain::config::{ConfigFormat, RunConfig};
use altimetry_chain::core::record::JsonRecord;
use altimetry_chain::core::resources::{write_grid, DatasetKind, GridData, GridMeta};
use std::path::{Path, PathBuf};

pub const CRYOTEMPO_STAGES: &str =
    r#""identify_file", "skip_on_mode", "ref_dem", "surface_type", "filter_height""#;

/// Write a 3x3 DEM (1000 m everywhere) and a 3x3 mask (basin 1 except the
/// top-left cell) with 1 km cells and the origin in the centre cell
pub fn write_grids(dir: &Path) -> (PathBuf, PathBuf) {
    let grid = |name: &str, kind: DatasetKind, values: Vec<f32>| GridData {
        meta: GridMeta {
            name: name.to_string(),
            kind,
            projection: "EPSG:3031".to_string(),
            rows: 3,
            cols: 3,
            x_min: -1000.0,
            y_max: 1000.0,
            resolution: 1000.0,
            nodata: None,
            basin_scheme: None,
        },
        values,
    };

    let dem_path = dir.join("ant_dem.json");
    let mask_path = dir.join("ant_mask.json");
    write_grid(&dem_path, &grid("ant_dem", DatasetKind::Dem, vec![1000.0; 9])).unwrap();
    write_grid(
        &mask_path,
        &grid(
            "ant_mask",
            DatasetKind::Mask,
            vec![0.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0],
        ),
    )
    .unwrap();
    (dem_path, mask_path)
}

/// Config text for the land ice chain over the grids in `dir`
pub fn cryotempo_config(dir: &Path, stages: &str, extra: &str) -> String {
    format!(
        r#"
[chain]
name = "cryotempo"
stages = [{stages}]

[datasets.ant_dem]
kind = "dem"
path = '{dem}'

[datasets.ant_mask]
kind = "mask"
path = '{mask}'

[stages.ref_dem]
antarctic_dem = "ant_dem"

[stages.surface_type]
antarctic_mask = "ant_mask"

[stages.filter_height.height_filters]
max_diff_to_ref_dem = 50.0
min_elevation_antarctica = -500.0
max_elevation_antarctica = 4900.0
min_elevation_greenland = -500.0
max_elevation_greenland = 3300.0

{extra}
"#,
        dem = dir.join("ant_dem.json").display(),
        mask = dir.join("ant_mask.json").display(),
    )
}

pub fn parse_config(text: &str) -> RunConfig {
    RunConfig::from_str_with_format(text, ConfigFormat::Toml).unwrap()
}

/// A synthetic Antarctic pass
pub struct Pass {
    pub op_mode: &'static str,
    pub x: f64,
    pub inject: Option<&'static str>,
}

impl Pass {
    pub fn sin() -> Self {
        Self {
            op_mode: "SARIN",
            x: 0.0,
            inject: None,
        }
    }

    pub fn mode(mut self, op_mode: &'static str) -> Self {
        self.op_mode = op_mode;
        self
    }

    pub fn at_x(mut self, x: f64) -> Self {
        self.x = x;
        self
    }

    pub fn inject(mut self, action: &'static str) -> Self {
        self.inject = Some(action);
        self
    }

    /// Write the pass as `<dir>/<name>` and return its path
    pub fn write(&self, dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        let mut record = JsonRecord::new(&path)
            .with_attribute("sir_op_mode", self.op_mode)
            .with_variable("lat_20_ku", vec![-75.0, -75.1])
            .with_variable("x_20_ku", vec![self.x, self.x])
            .with_variable("y_20_ku", vec![0.0, 0.0])
            .with_variable("height_20_ku", vec![1010.0, 5000.0]);
        if let Some(action) = self.inject {
            record = record.with_attribute("inject", action);
        }
        std::fs::write(&path, record.to_json()).unwrap();
        path
    }
}

/// CryoSat-2 L1b file name
pub fn l1b_name(mode: &str, date: &str, baseline: char) -> String {
    format!("CS_LTA__SIR_{mode}_1B_{date}T000000_{date}T001000_{baseline}001.json")
}

/// Add `lines` to the `[chain]` table of a config from [`cryotempo_config`]
pub fn with_chain_settings(config: &str, lines: &str) -> String {
    config.replacen("\n\n[datasets", &format!("\n{lines}\n\n[datasets"), 1)
}
