//! Dataset sources: where grids come from before they are published.
//!
//! The built-in format is a JSON header next to a raw payload of
//! little-endian f32 cells:
//!
//! ```json
//! {
//!   "projection": "EPSG:3031",
//!   "rows": 2, "cols": 3,
//!   "x_min": -2700000.0, "y_max": 2700000.0, "resolution": 1000.0,
//!   "nodata": -9999.0,
//!   "data": "rema_ant_1km.bin"
//! }
//! ```
//!
//! `data` is resolved relative to the header. Payloads of 1MB and above
//! are memory mapped while decoding.

use super::{GridData, GridMeta};
use crate::config::DatasetDefinition;
use crate::error::DatasetError;
use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};

/// Minimum payload size to read through a memory map (1MB)
const MMAP_THRESHOLD: u64 = 1024 * 1024;

/// Loads a dataset's cells and metadata
pub trait DatasetSource: Send + Sync {
    fn load(&self, name: &str, definition: &DatasetDefinition) -> Result<GridData, DatasetError>;
}

/// On-disk header of a grid file
#[derive(Debug, Clone, Serialize, Deserialize)]
struct GridHeader {
    projection: String,
    rows: usize,
    cols: usize,
    x_min: f64,
    y_max: f64,
    resolution: f64,
    #[serde(default)]
    nodata: Option<f32>,
    #[serde(default)]
    basin_scheme: Option<String>,
    data: PathBuf,
}

/// Reads JSON-header grids from disk
#[derive(Debug, Default, Clone, Copy)]
pub struct GridFileSource;

impl DatasetSource for GridFileSource {
    fn load(&self, name: &str, definition: &DatasetDefinition) -> Result<GridData, DatasetError> {
        let header_path = &definition.path;
        let text = std::fs::read_to_string(header_path).map_err(|e| DatasetError::Load {
            name: name.to_string(),
            path: header_path.clone(),
            source: e,
        })?;
        let header: GridHeader =
            serde_json::from_str(&text).map_err(|e| DatasetError::InvalidHeader {
                path: header_path.clone(),
                reason: e.to_string(),
            })?;
        if header.resolution <= 0.0 {
            return Err(DatasetError::InvalidHeader {
                path: header_path.clone(),
                reason: format!("resolution must be positive, got {}", header.resolution),
            });
        }

        let data_path = header_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(&header.data);
        let bytes = read_payload(&data_path).map_err(|e| DatasetError::Load {
            name: name.to_string(),
            path: data_path.clone(),
            source: e,
        })?;

        let (expected, expected_bytes) = header
            .rows
            .checked_mul(header.cols)
            .and_then(|cells| Some((cells, cells.checked_mul(4)?)))
            .ok_or_else(|| DatasetError::InvalidHeader {
                path: header_path.clone(),
                reason: format!(
                    "{} rows x {} cols is too large to address",
                    header.rows, header.cols
                ),
            })?;
        if bytes.len() != expected_bytes {
            return Err(DatasetError::ShapeMismatch {
                name: name.to_string(),
                expected,
                actual: bytes.len() / 4,
            });
        }
        let values = bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();

        tracing::debug!(dataset = name, rows = header.rows, cols = header.cols, "Loaded grid");
        Ok(GridData {
            meta: GridMeta {
                name: name.to_string(),
                kind: definition.kind,
                projection: header.projection,
                rows: header.rows,
                cols: header.cols,
                x_min: header.x_min,
                y_max: header.y_max,
                resolution: header.resolution,
                nodata: header.nodata,
                basin_scheme: header.basin_scheme,
            },
            values,
        })
    }
}

/// Write a grid in the format `GridFileSource` reads. The payload is placed
/// next to the header with a `.bin` extension.
pub fn write_grid(header_path: &Path, data: &GridData) -> std::io::Result<()> {
    let data_path = header_path.with_extension("bin");
    let header = GridHeader {
        projection: data.meta.projection.clone(),
        rows: data.meta.rows,
        cols: data.meta.cols,
        x_min: data.meta.x_min,
        y_max: data.meta.y_max,
        resolution: data.meta.resolution,
        nodata: data.meta.nodata,
        basin_scheme: data.meta.basin_scheme.clone(),
        data: PathBuf::from(data_path.file_name().unwrap_or_default()),
    };
    let json = serde_json::to_string_pretty(&header).map_err(std::io::Error::other)?;
    let payload: Vec<u8> = data.values.iter().flat_map(|v| v.to_le_bytes()).collect();
    std::fs::write(&data_path, payload)?;
    std::fs::write(header_path, json)
}

enum Payload {
    Vec(Vec<u8>),
    Mmap(Mmap),
}

impl std::ops::Deref for Payload {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Payload::Vec(v) => v,
            Payload::Mmap(m) => m,
        }
    }
}

fn read_payload(path: &Path) -> std::io::Result<Payload> {
    let metadata = std::fs::metadata(path)?;
    if metadata.len() >= MMAP_THRESHOLD {
        let file = File::open(path)?;
        // SAFETY: read-only map, dropped before this load returns
        let map = unsafe { Mmap::map(&file) }?;
        Ok(Payload::Mmap(map))
    } else {
        Ok(Payload::Vec(std::fs::read(path)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::resources::tests::sample_grid;
    use crate::core::resources::DatasetKind;
    use tempfile::TempDir;

    fn definition(path: PathBuf) -> DatasetDefinition {
        DatasetDefinition {
            kind: DatasetKind::Dem,
            path,
        }
    }

    #[test]
    fn written_grid_loads_back() {
        let dir = TempDir::new().unwrap();
        let header = dir.path().join("dem.json");
        let grid = sample_grid("dem", DatasetKind::Dem);
        write_grid(&header, &grid).unwrap();

        let loaded = GridFileSource.load("dem", &definition(header)).unwrap();

        assert_eq!(loaded.meta, grid.meta);
        assert_eq!(loaded.values, grid.values);
    }

    #[test]
    fn large_payload_is_read_through_mmap() {
        let dir = TempDir::new().unwrap();
        let header = dir.path().join("big.json");
        let mut grid = sample_grid("big", DatasetKind::Dem);
        grid.meta.rows = 512;
        grid.meta.cols = 600;
        grid.values = (0..512 * 600).map(|i| i as f32).collect();
        write_grid(&header, &grid).unwrap();

        let loaded = GridFileSource.load("big", &definition(header)).unwrap();

        assert_eq!(loaded.values.len(), 512 * 600);
        assert_eq!(loaded.values[1234], 1234.0);
    }

    #[test]
    fn missing_header_is_a_load_error() {
        let result = GridFileSource.load("dem", &definition(PathBuf::from("/nonexistent/dem.json")));
        assert!(matches!(result, Err(DatasetError::Load { .. })));
    }

    #[test]
    fn short_payload_is_a_shape_mismatch() {
        let dir = TempDir::new().unwrap();
        let header = dir.path().join("dem.json");
        write_grid(&header, &sample_grid("dem", DatasetKind::Dem)).unwrap();
        std::fs::write(dir.path().join("dem.bin"), [0u8; 8]).unwrap();

        let result = GridFileSource.load("dem", &definition(header));

        assert!(matches!(
            result,
            Err(DatasetError::ShapeMismatch { expected: 4, actual: 2, .. })
        ));
    }

    #[test]
    fn oversized_header_is_rejected_without_overflow() {
        let dir = TempDir::new().unwrap();
        let header = dir.path().join("dem.json");
        write_grid(&header, &sample_grid("dem", DatasetKind::Dem)).unwrap();
        let mut json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&header).unwrap()).unwrap();
        json["rows"] = serde_json::json!(1u64 << 33);
        json["cols"] = serde_json::json!(1u64 << 33);
        std::fs::write(&header, json.to_string()).unwrap();

        let result = GridFileSource.load("dem", &definition(header));

        assert!(matches!(
            result,
            Err(DatasetError::InvalidHeader { reason, .. }) if reason.contains("too large")
        ));
    }

    #[test]
    fn malformed_header_is_rejected() {
        let dir = TempDir::new().unwrap();
        let header = dir.path().join("dem.json");
        std::fs::write(&header, "{\"rows\": 2}").unwrap();

        let result = GridFileSource.load("dem", &definition(header));
        assert!(matches!(result, Err(DatasetError::InvalidHeader { .. })));
    }
}
