//! In-memory dataset backend for sequential runs.

use super::{DatasetBackend, DatasetStats, GridData, SharedDataset};
use crate::error::DatasetError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Process-local dataset backend
///
/// Datasets live on the heap and are dropped once released and no stage
/// holds an `Arc` to them.
pub struct InMemoryBackend {
    entries: RwLock<HashMap<String, Arc<SharedDataset>>>,
    build_lock: Mutex<()>,
    constructions: AtomicUsize,
}

impl InMemoryBackend {
    /// Create an empty backend
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            build_lock: Mutex::new(()),
            constructions: AtomicUsize::new(0),
        }
    }

    fn cached(&self, name: &str) -> Result<Option<Arc<SharedDataset>>, DatasetError> {
        let entries = self.entries.read().map_err(|_| DatasetError::Poisoned)?;
        Ok(entries.get(name).cloned())
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DatasetBackend for InMemoryBackend {
    fn obtain(
        &self,
        name: &str,
        build: &dyn Fn() -> Result<GridData, DatasetError>,
    ) -> Result<Arc<SharedDataset>, DatasetError> {
        if let Some(dataset) = self.cached(name)? {
            return Ok(dataset);
        }

        // One builder at a time so concurrent first requests build once
        let _guard = self.build_lock.lock().map_err(|_| DatasetError::Poisoned)?;
        if let Some(dataset) = self.cached(name)? {
            return Ok(dataset);
        }

        let dataset = Arc::new(SharedDataset::owned(build()?)?);
        self.constructions.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(dataset = name, cells = dataset.meta().len(), "Built dataset");

        let mut entries = self.entries.write().map_err(|_| DatasetError::Poisoned)?;
        entries.insert(name.to_string(), dataset.clone());
        Ok(dataset)
    }

    fn release(&self, name: &str) -> Result<bool, DatasetError> {
        let mut entries = self.entries.write().map_err(|_| DatasetError::Poisoned)?;
        Ok(entries.remove(name).is_some())
    }

    fn release_all(&self) -> Result<usize, DatasetError> {
        let mut entries = self.entries.write().map_err(|_| DatasetError::Poisoned)?;
        let released = entries.len();
        entries.clear();
        Ok(released)
    }

    fn stats(&self) -> Result<DatasetStats, DatasetError> {
        let entries = self.entries.read().map_err(|_| DatasetError::Poisoned)?;
        Ok(DatasetStats {
            datasets: entries.len(),
            constructions: self.constructions.load(Ordering::Relaxed),
            attachments: 0,
            bytes: entries
                .values()
                .map(|d| (d.values().len() * std::mem::size_of::<f32>()) as u64)
                .sum(),
        })
    }
}
