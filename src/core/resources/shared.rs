//! Shared-memory dataset backend for multi-process runs.
//!
//! Each dataset lives in one segment file under
//! `<root>/altimetry-chain-<namespace>/`, where root is `/dev/shm` on Linux:
//!
//! | offset | content                                         |
//! |--------|-------------------------------------------------|
//! | 0      | magic `ACSEG001`                                |
//! | 8      | metadata length, u64 LE                         |
//! | 16     | xxh3 of the metadata, u64 LE                    |
//! | 24     | metadata JSON, zero padded to a 64 byte boundary|
//! | ..     | f32 cells, row major, host byte order           |
//!
//! Publication is guarded by `<name>.lock`, created with `create_new`. The
//! process holding it builds the grid into a temp file and persists it
//! without clobbering. Every process mapping a segment owns a marker file
//! `<name>.refs/<pid>`; the segment is deleted when the last marker goes.
//! Markers of processes that died are removed by the supervisor with
//! [`SharedMemoryBackend::reap`].

use super::{DatasetBackend, DatasetStats, GridData, GridMeta, SharedDataset};
use crate::error::DatasetError;
use memmap2::Mmap;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;
use xxhash_rust::xxh3::xxh3_64;

const MAGIC: &[u8; 8] = b"ACSEG001";
const HEADER_FIXED: usize = 24;
const PAYLOAD_ALIGN: usize = 64;
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Dataset backend publishing grids as memory-mapped segment files
pub struct SharedMemoryBackend {
    dir: PathBuf,
    pid: u32,
    publish_timeout: Duration,
    attached: RwLock<HashMap<String, Arc<SharedDataset>>>,
    build_lock: Mutex<()>,
    constructions: AtomicUsize,
    attachments: AtomicUsize,
}

impl SharedMemoryBackend {
    /// Open (creating if needed) the segment directory for a run namespace
    pub fn new(root: &Path, namespace: &str, publish_timeout: Duration) -> Result<Self, DatasetError> {
        let dir = Self::namespace_dir(root, namespace);
        fs::create_dir_all(&dir).map_err(|e| segment_error(&dir, e))?;
        Ok(Self {
            dir,
            pid: std::process::id(),
            publish_timeout,
            attached: RwLock::new(HashMap::new()),
            build_lock: Mutex::new(()),
            constructions: AtomicUsize::new(0),
            attachments: AtomicUsize::new(0),
        })
    }

    /// Directory holding a namespace's segments
    pub fn namespace_dir(root: &Path, namespace: &str) -> PathBuf {
        root.join(format!("altimetry-chain-{namespace}"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Pretend to be another process (tests run many backends in one process)
    #[cfg(test)]
    pub(crate) fn with_process_id(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }

    /// Remove the reference markers of processes that exited without
    /// releasing, deleting segments nobody references any more.
    ///
    /// Returns the number of markers removed.
    pub fn reap(dir: &Path, pids: &[u32]) -> Result<usize, DatasetError> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(segment_error(dir, e)),
        };

        let mut reaped = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(stem) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(".refs"))
                .map(str::to_string)
            else {
                continue;
            };
            for pid in pids {
                let marker = path.join(pid.to_string());
                if remove_if_exists(&marker)? {
                    tracing::warn!(segment = %stem, pid, "Reaped reference of exited worker");
                    reaped += 1;
                }
            }
            collect_if_unreferenced(dir, &stem)?;
        }
        Ok(reaped)
    }

    fn segment_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.seg", segment_stem(name)))
    }

    fn lock_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", segment_stem(name)))
    }

    fn refs_dir(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.refs", segment_stem(name)))
    }

    fn cached(&self, name: &str) -> Result<Option<Arc<SharedDataset>>, DatasetError> {
        let attached = self.attached.read().map_err(|_| DatasetError::Poisoned)?;
        Ok(attached.get(name).cloned())
    }

    fn add_reference(&self, name: &str) -> Result<(), DatasetError> {
        let refs = self.refs_dir(name);
        let marker = refs.join(self.pid.to_string());
        // A releasing process may remove the empty refs dir between our
        // create_dir_all and the marker write, so retry once.
        for attempt in 0..2 {
            fs::create_dir_all(&refs).map_err(|e| segment_error(&refs, e))?;
            match File::create(&marker) {
                Ok(_) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound && attempt == 0 => continue,
                Err(e) => return Err(segment_error(&marker, e)),
            }
        }
        Ok(())
    }

    fn remove_reference(&self, name: &str) -> Result<bool, DatasetError> {
        remove_if_exists(&self.refs_dir(name).join(self.pid.to_string()))?;
        collect_if_unreferenced(&self.dir, &segment_stem(name))
    }

    fn attach_or_publish(
        &self,
        name: &str,
        build: &dyn Fn() -> Result<GridData, DatasetError>,
    ) -> Result<Arc<SharedDataset>, DatasetError> {
        let segment = self.segment_path(name);
        let lock = self.lock_path(name);
        let started = Instant::now();
        let mut built = false;

        loop {
            if let Some(dataset) = attach(&segment)? {
                if !built {
                    self.attachments.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(dataset = name, "Attached to shared segment");
                }
                return Ok(Arc::new(dataset));
            }

            match OpenOptions::new().write(true).create_new(true).open(&lock) {
                Ok(_) => {
                    let published = self.publish(name, &segment, build);
                    if let Err(e) = fs::remove_file(&lock) {
                        tracing::warn!(path = %lock.display(), error = %e, "Failed to remove publish lock");
                    }
                    published?;
                    built = true;
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if started.elapsed() >= self.publish_timeout {
                        return Err(DatasetError::PublishTimeout {
                            name: name.to_string(),
                            waited_secs: started.elapsed().as_secs(),
                        });
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(e) => return Err(segment_error(&lock, e)),
            }
        }
    }

    fn publish(
        &self,
        name: &str,
        segment: &Path,
        build: &dyn Fn() -> Result<GridData, DatasetError>,
    ) -> Result<(), DatasetError> {
        let data = build()?;
        data.validate()?;

        let header = encode_header(&data.meta, segment)?;
        let mut file = NamedTempFile::new_in(&self.dir).map_err(|e| segment_error(&self.dir, e))?;
        file.write_all(&header)
            .and_then(|_| file.write_all(bytemuck::cast_slice::<f32, u8>(&data.values)))
            .and_then(|_| file.flush())
            .map_err(|e| segment_error(segment, e))?;

        match file.persist_noclobber(segment) {
            Ok(_) => {
                self.constructions.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    dataset = name,
                    cells = data.meta.len(),
                    path = %segment.display(),
                    "Published shared dataset"
                );
            }
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
                tracing::debug!(dataset = name, "Segment appeared while publishing");
            }
            Err(e) => return Err(segment_error(segment, e.error)),
        }
        Ok(())
    }
}

impl DatasetBackend for SharedMemoryBackend {
    fn obtain(
        &self,
        name: &str,
        build: &dyn Fn() -> Result<GridData, DatasetError>,
    ) -> Result<Arc<SharedDataset>, DatasetError> {
        if let Some(dataset) = self.cached(name)? {
            return Ok(dataset);
        }

        let _guard = self.build_lock.lock().map_err(|_| DatasetError::Poisoned)?;
        if let Some(dataset) = self.cached(name)? {
            return Ok(dataset);
        }

        // The marker goes in before mapping so a concurrent release never
        // deletes a segment we are about to use.
        self.add_reference(name)?;
        match self.attach_or_publish(name, build) {
            Ok(dataset) => {
                let mut attached = self.attached.write().map_err(|_| DatasetError::Poisoned)?;
                attached.insert(name.to_string(), dataset.clone());
                Ok(dataset)
            }
            Err(e) => {
                if let Err(cleanup) = self.remove_reference(name) {
                    tracing::warn!(dataset = name, error = %cleanup, "Failed to drop reference");
                }
                Err(e)
            }
        }
    }

    fn release(&self, name: &str) -> Result<bool, DatasetError> {
        let removed = {
            let mut attached = self.attached.write().map_err(|_| DatasetError::Poisoned)?;
            attached.remove(name)
        };
        if removed.is_none() {
            return Ok(false);
        }
        drop(removed);

        if self.remove_reference(name)? {
            tracing::debug!(dataset = name, "Freed shared segment");
        }
        Ok(true)
    }

    fn release_all(&self) -> Result<usize, DatasetError> {
        let names: Vec<String> = {
            let attached = self.attached.read().map_err(|_| DatasetError::Poisoned)?;
            attached.keys().cloned().collect()
        };
        let mut released = 0;
        for name in names {
            if self.release(&name)? {
                released += 1;
            }
        }
        // Only succeeds once every segment and marker is gone
        let _ = fs::remove_dir(&self.dir);
        Ok(released)
    }

    fn stats(&self) -> Result<DatasetStats, DatasetError> {
        let attached = self.attached.read().map_err(|_| DatasetError::Poisoned)?;
        Ok(DatasetStats {
            datasets: attached.len(),
            constructions: self.constructions.load(Ordering::Relaxed),
            attachments: self.attachments.load(Ordering::Relaxed),
            bytes: attached
                .values()
                .map(|d| (d.values().len() * std::mem::size_of::<f32>()) as u64)
                .sum(),
        })
    }

    fn is_shared(&self) -> bool {
        true
    }
}

impl Drop for SharedMemoryBackend {
    fn drop(&mut self) {
        if let Err(e) = self.release_all() {
            tracing::warn!(dir = %self.dir.display(), error = %e, "Failed to release shared datasets");
        }
    }
}

/// Map a published segment, or None if it does not exist (yet)
fn attach(path: &Path) -> Result<Option<SharedDataset>, DatasetError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(segment_error(path, e)),
    };

    // SAFETY: segments are never written after being persisted, and the file
    // handle outlives the map creation.
    let map = unsafe { Mmap::map(&file) }.map_err(|e| segment_error(path, e))?;
    let (meta, offset) = decode_header(&map, path)?;
    SharedDataset::mapped(meta, map, offset, path).map(Some)
}

fn encode_header(meta: &GridMeta, path: &Path) -> Result<Vec<u8>, DatasetError> {
    let json = serde_json::to_vec(meta).map_err(|e| DatasetError::InvalidHeader {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let mut header = Vec::with_capacity(align_up(HEADER_FIXED + json.len(), PAYLOAD_ALIGN));
    header.extend_from_slice(MAGIC);
    header.extend_from_slice(&(json.len() as u64).to_le_bytes());
    header.extend_from_slice(&xxh3_64(&json).to_le_bytes());
    header.extend_from_slice(&json);
    header.resize(align_up(header.len(), PAYLOAD_ALIGN), 0);
    Ok(header)
}

fn decode_header(bytes: &[u8], path: &Path) -> Result<(GridMeta, usize), DatasetError> {
    let corrupt = |reason: &str| DatasetError::CorruptSegment {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };

    if bytes.len() < HEADER_FIXED || &bytes[..8] != MAGIC {
        return Err(corrupt("bad magic"));
    }
    let meta_len = read_u64(bytes, 8) as usize;
    let checksum = read_u64(bytes, 16);
    let meta_end = HEADER_FIXED
        .checked_add(meta_len)
        .filter(|end| *end <= bytes.len())
        .ok_or_else(|| corrupt("metadata truncated"))?;

    let json = &bytes[HEADER_FIXED..meta_end];
    if xxh3_64(json) != checksum {
        return Err(corrupt("metadata checksum mismatch"));
    }
    let meta: GridMeta =
        serde_json::from_slice(json).map_err(|e| corrupt(&format!("unreadable metadata: {e}")))?;
    Ok((meta, align_up(meta_end, PAYLOAD_ALIGN)))
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(buf)
}

fn align_up(n: usize, align: usize) -> usize {
    n.div_ceil(align) * align
}

/// File stem for a dataset name; unsafe characters are replaced and a hash
/// keeps distinct names distinct.
fn segment_stem(name: &str) -> String {
    let safe = |c: char| c.is_ascii_alphanumeric() || c == '_' || c == '-';
    if !name.is_empty() && name.chars().all(safe) {
        return name.to_string();
    }
    let cleaned: String = name.chars().map(|c| if safe(c) { c } else { '_' }).collect();
    format!("{cleaned}-{:016x}", xxh3_64(name.as_bytes()))
}

/// Delete a segment once its refs dir is empty. Returns true if deleted.
fn collect_if_unreferenced(dir: &Path, stem: &str) -> Result<bool, DatasetError> {
    let refs = dir.join(format!("{stem}.refs"));
    let unreferenced = match fs::read_dir(&refs) {
        Ok(mut entries) => entries.next().is_none(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => true,
        Err(e) => return Err(segment_error(&refs, e)),
    };
    if !unreferenced {
        return Ok(false);
    }
    let removed = remove_if_exists(&dir.join(format!("{stem}.seg")))?;
    let _ = fs::remove_dir(&refs);
    Ok(removed)
}

fn remove_if_exists(path: &Path) -> Result<bool, DatasetError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(segment_error(path, e)),
    }
}

fn segment_error(path: &Path, source: io::Error) -> DatasetError {
    DatasetError::Segment {
        path: path.to_path_buf(),
        source,
    }
}
