//! Dataset backend trait definition.

use super::{DatasetStats, GridData, SharedDataset};
use crate::error::DatasetError;
use std::sync::Arc;

/// Storage strategy behind `SharedResourceCache`
pub trait DatasetBackend: Send + Sync {
    /// Return the dataset called `name`, calling `build` only if no copy
    /// exists yet (in this process, or on the host for shared backends).
    fn obtain(
        &self,
        name: &str,
        build: &dyn Fn() -> Result<GridData, DatasetError>,
    ) -> Result<Arc<SharedDataset>, DatasetError>;

    /// Drop this process's reference to a dataset
    ///
    /// Returns false if the process held no reference.
    fn release(&self, name: &str) -> Result<bool, DatasetError>;

    /// Drop every reference held by this process
    ///
    /// Returns the number of datasets released.
    fn release_all(&self) -> Result<usize, DatasetError>;

    /// Get backend statistics
    fn stats(&self) -> Result<DatasetStats, DatasetError>;

    /// Whether datasets are visible to other processes
    fn is_shared(&self) -> bool {
        false
    }
}
