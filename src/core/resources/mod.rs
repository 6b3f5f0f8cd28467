//! # Resources Module
//!
//! Large read-only reference datasets (DEMs, masks) shared by stages.
//!
//! ## Lifecycle
//! A dataset is built on first request and reused by every later request
//! for the same name. It never changes after publication; stages only query
//! it.
//!
//! ## Backends
//! - `InMemoryBackend` - plain process-local cache (sequential runs)
//! - `SharedMemoryBackend` - one memory-mapped segment per dataset shared by
//!   all worker processes on the host, reference counted per process
//!
//! ## Example
//! ```rust,ignore
//! let cache = SharedResourceCache::from_config(&config, source, false)?;
//! let dem = cache.get_kind("rema_ant_1km", DatasetKind::Dem)?;
//! let heights = dem.interpolate(&points, Interpolation::Linear);
//! ```

mod grid;
mod memory;
mod shared;
mod source;
mod traits;

pub use grid::{Interpolation, Point};
pub use memory::InMemoryBackend;
pub use shared::SharedMemoryBackend;
pub use source::{write_grid, DatasetSource, GridFileSource};
pub use traits::DatasetBackend;

use crate::config::{DatasetDefinition, RunConfig};
use crate::error::DatasetError;
use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// What a grid's cells hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetKind {
    /// Surface elevations in metres
    Dem,
    /// Integer categories (basins, ice/ocean classes) stored as floats
    Mask,
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatasetKind::Dem => write!(f, "dem"),
            DatasetKind::Mask => write!(f, "mask"),
        }
    }
}

/// Grid metadata, also stored in shared segment headers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridMeta {
    /// Dataset name from the config
    pub name: String,
    pub kind: DatasetKind,
    /// Projection identifier, e.g. "EPSG:3031"
    pub projection: String,
    pub rows: usize,
    pub cols: usize,
    /// X of the first column's cell centre
    pub x_min: f64,
    /// Y of the first row's cell centre
    pub y_max: f64,
    /// Cell size in projection units
    pub resolution: f64,
    /// Void marker
    #[serde(default)]
    pub nodata: Option<f32>,
    /// Basin numbering scheme for masks, e.g. "zwally_2012"
    #[serde(default)]
    pub basin_scheme: Option<String>,
}

impl GridMeta {
    /// Number of cells (saturates for headers too large to address)
    pub fn len(&self) -> usize {
        self.rows.saturating_mul(self.cols)
    }

    /// Payload size in bytes, None when it does not fit in `usize`
    pub fn byte_len(&self) -> Option<usize> {
        self.rows
            .checked_mul(self.cols)
            .and_then(|cells| cells.checked_mul(std::mem::size_of::<f32>()))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A freshly loaded grid, before publication
#[derive(Debug, Clone)]
pub struct GridData {
    pub meta: GridMeta,
    pub values: Vec<f32>,
}

impl GridData {
    /// Check the payload matches the declared shape
    pub fn validate(&self) -> Result<(), DatasetError> {
        if self.values.len() != self.meta.len() {
            return Err(DatasetError::ShapeMismatch {
                name: self.meta.name.clone(),
                expected: self.meta.len(),
                actual: self.values.len(),
            });
        }
        Ok(())
    }
}

enum GridStorage {
    Owned(Vec<f32>),
    Mapped { map: Mmap, offset: usize },
}

/// A published, immutable dataset
pub struct SharedDataset {
    meta: GridMeta,
    storage: GridStorage,
}

impl SharedDataset {
    pub(crate) fn owned(data: GridData) -> Result<Self, DatasetError> {
        data.validate()?;
        Ok(Self {
            meta: data.meta,
            storage: GridStorage::Owned(data.values),
        })
    }

    /// Wrap a mapped segment whose payload starts at `offset`
    pub(crate) fn mapped(
        meta: GridMeta,
        map: Mmap,
        offset: usize,
        path: &std::path::Path,
    ) -> Result<Self, DatasetError> {
        let byte_len = meta.byte_len().ok_or_else(|| DatasetError::CorruptSegment {
            path: path.to_path_buf(),
            reason: format!("{} x {} cells overflow the address space", meta.rows, meta.cols),
        })?;
        let payload = offset
            .checked_add(byte_len)
            .and_then(|end| map.get(offset..end))
            .ok_or_else(|| DatasetError::CorruptSegment {
                path: path.to_path_buf(),
                reason: format!(
                    "payload truncated: expected {byte_len} bytes after offset {offset}, file has {}",
                    map.len()
                ),
            })?;
        bytemuck::try_cast_slice::<u8, f32>(payload).map_err(|e| DatasetError::CorruptSegment {
            path: path.to_path_buf(),
            reason: format!("payload is not a valid f32 array: {e}"),
        })?;
        Ok(Self {
            meta,
            storage: GridStorage::Mapped { map, offset },
        })
    }

    pub fn meta(&self) -> &GridMeta {
        &self.meta
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }

    pub fn kind(&self) -> DatasetKind {
        self.meta.kind
    }

    /// True when the cells live in a shared segment
    pub fn is_shared(&self) -> bool {
        matches!(self.storage, GridStorage::Mapped { .. })
    }

    /// Cell values, row major
    pub fn values(&self) -> &[f32] {
        match &self.storage {
            GridStorage::Owned(values) => values,
            GridStorage::Mapped { map, offset } => {
                // Layout was checked in `mapped`
                self.meta
                    .byte_len()
                    .and_then(|len| map.get(*offset..offset.checked_add(len)?))
                    .and_then(|payload| bytemuck::try_cast_slice(payload).ok())
                    .unwrap_or(&[])
            }
        }
    }

    /// Sample the grid at each point (NaN outside or on voids)
    pub fn interpolate(&self, points: &[Point], method: Interpolation) -> Vec<f64> {
        grid::interpolate(&self.meta, self.values(), points, method)
    }

    /// Test each point for membership in the mask
    pub fn membership(&self, points: &[Point], basins: Option<&[i32]>) -> Vec<bool> {
        grid::membership(&self.meta, self.values(), points, basins)
    }
}

impl fmt::Debug for SharedDataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedDataset")
            .field("meta", &self.meta)
            .field("shared", &self.is_shared())
            .finish()
    }
}

/// Result of a point lookup
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    /// Interpolated values (DEM grids)
    Values(Vec<f64>),
    /// Membership flags (masks)
    Membership(Vec<bool>),
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetStats {
    /// Datasets currently held by this process
    pub datasets: usize,
    /// Datasets this process built
    pub constructions: usize,
    /// Datasets this process attached to after another process built them
    pub attachments: usize,
    /// Payload bytes held
    pub bytes: u64,
}

/// Process-wide cache of reference datasets
pub struct SharedResourceCache {
    definitions: BTreeMap<String, DatasetDefinition>,
    source: Arc<dyn DatasetSource>,
    backend: Box<dyn DatasetBackend>,
}

impl SharedResourceCache {
    /// Create a cache over an explicit backend
    pub fn new(
        definitions: BTreeMap<String, DatasetDefinition>,
        source: Arc<dyn DatasetSource>,
        backend: Box<dyn DatasetBackend>,
    ) -> Self {
        Self {
            definitions,
            source,
            backend,
        }
    }

    /// Process-local cache
    pub fn in_memory(
        definitions: BTreeMap<String, DatasetDefinition>,
        source: Arc<dyn DatasetSource>,
    ) -> Self {
        Self::new(definitions, source, Box::new(InMemoryBackend::new()))
    }

    /// Cache for a run. Shared memory is used when `shared` is set and the
    /// run has a namespace.
    pub fn from_config(
        config: &RunConfig,
        source: Arc<dyn DatasetSource>,
        shared: bool,
    ) -> Result<Self, DatasetError> {
        let definitions = config.datasets.clone();
        match (&config.shared_memory.namespace, shared) {
            (Some(namespace), true) => {
                let backend = SharedMemoryBackend::new(
                    &config.shared_memory.root_dir(),
                    namespace,
                    Duration::from_secs(config.shared_memory.publish_timeout_secs),
                )?;
                Ok(Self::new(definitions, source, Box::new(backend)))
            }
            _ => Ok(Self::in_memory(definitions, source)),
        }
    }

    /// Names of all configured datasets
    pub fn dataset_names(&self) -> impl Iterator<Item = &str> {
        self.definitions.keys().map(String::as_str)
    }

    /// Get a dataset, building or attaching to it on first use
    pub fn get(&self, name: &str) -> Result<Arc<SharedDataset>, DatasetError> {
        let definition = self
            .definitions
            .get(name)
            .ok_or_else(|| DatasetError::Unknown {
                name: name.to_string(),
            })?;
        let source = &self.source;
        let dataset = self
            .backend
            .obtain(name, &|| source.load(name, definition))?;
        if dataset.kind() != definition.kind {
            return Err(DatasetError::WrongKind {
                name: name.to_string(),
                expected: definition.kind.to_string(),
                actual: dataset.kind().to_string(),
            });
        }
        Ok(dataset)
    }

    /// Get a dataset that must be of a given kind
    pub fn get_kind(&self, name: &str, kind: DatasetKind) -> Result<Arc<SharedDataset>, DatasetError> {
        let dataset = self.get(name)?;
        if dataset.kind() != kind {
            return Err(DatasetError::WrongKind {
                name: name.to_string(),
                expected: kind.to_string(),
                actual: dataset.kind().to_string(),
            });
        }
        Ok(dataset)
    }

    /// Look up points in a dataset: DEMs are interpolated bilinearly, masks
    /// report membership of any positive category.
    pub fn lookup(&self, points: &[Point], name: &str) -> Result<Lookup, DatasetError> {
        let dataset = self.get(name)?;
        Ok(match dataset.kind() {
            DatasetKind::Dem => Lookup::Values(dataset.interpolate(points, Interpolation::Linear)),
            DatasetKind::Mask => Lookup::Membership(dataset.membership(points, None)),
        })
    }

    /// Drop this process's reference to a dataset
    pub fn release(&self, name: &str) -> Result<bool, DatasetError> {
        self.backend.release(name)
    }

    /// Drop every reference this process holds
    pub fn release_all(&self) -> Result<usize, DatasetError> {
        self.backend.release_all()
    }

    pub fn stats(&self) -> Result<DatasetStats, DatasetError> {
        self.backend.stats()
    }

    /// True when datasets are published through shared memory
    pub fn is_shared(&self) -> bool {
        self.backend.is_shared()
    }
}
