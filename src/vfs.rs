//! The VFS / FileManager: the single I/O chokepoint mediating all step
//! access to storage backends (spec §4.1). Addresses are `(backend_id,
//! virtual_path)` pairs; the manager resolves them to the right backend and
//! guarantees at most one writer per path for the lifetime of a well's
//! execution, using the same `DashMap`-backed concurrent-lock-table idiom
//! the teacher uses for its `SessionManager` (`memory.rs`).

use crate::error::Result;
use crate::io_error;
use crate::model::{Dtype, Pattern};
use crate::storage::StorageBackend;
use dashmap::DashMap;
use ndarray::Array3;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A decoded 2D (one Z-plane) image, the VFS's on-the-wire representation
/// for a single input file. Real pixel codecs (TIFF, etc.) are out of scope
/// (spec §1 non-goals — no image-processing algorithms); this is the
/// boundary representation the rest of the engine routes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredPlane {
    pub dtype: Dtype,
    pub height: usize,
    pub width: usize,
    pub data: Vec<f32>,
}

/// A 3D array tagged with the dtype it should round-trip to on write (spec
/// §3 "Image array").
#[derive(Debug, Clone)]
pub struct RawImage {
    pub array: Array3<f32>,
    pub dtype: Dtype,
}

/// A non-image named value (spec §4.1 "special (non-image) inputs/outputs").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NamedValue {
    Json(serde_json::Value),
    Blob(Vec<u8>),
}

/// RAII guard: the lock table entry is removed on drop regardless of which
/// exit path the caller takes (spec §9 "scoped acquisition with guaranteed
/// release").
pub struct WriterGuard<'a> {
    manager: &'a FileManager,
    key: (String, String),
}

impl<'a> Drop for WriterGuard<'a> {
    fn drop(&mut self) {
        self.manager.writer_locks.remove(&self.key);
    }
}

pub struct FileManager {
    backends: DashMap<String, Arc<dyn StorageBackend>>,
    writer_locks: DashMap<(String, String), ()>,
}

impl FileManager {
    pub fn new() -> Self {
        Self { backends: DashMap::new(), writer_locks: DashMap::new() }
    }

    pub fn register_backend(&self, backend: Arc<dyn StorageBackend>) {
        self.backends.insert(backend.id().to_string(), backend);
    }

    /// Resolves a registered backend by id. Exposed beyond this module for
    /// callers (e.g. the orchestrator's analysis-consolidation pass) that
    /// need to reach a backend directly rather than through a pattern.
    pub fn backend(&self, backend_id: &str) -> Result<Arc<dyn StorageBackend>> {
        self.backends
            .get(backend_id)
            .map(|b| b.clone())
            .ok_or_else(|| io_error!(backend_id, "", "resolve", "unknown backend"))
    }

    /// Acquires the at-most-one-writer lock for `(backend, path)`. Held for
    /// the lifetime of the returned guard.
    pub fn begin_write<'a>(&'a self, backend_id: &str, path: &str) -> Result<WriterGuard<'a>> {
        let key = (backend_id.to_string(), path.to_string());
        if self.writer_locks.insert(key.clone(), ()).is_some() {
            return Err(io_error!(backend_id, path, "begin_write", "path already has an active writer"));
        }
        Ok(WriterGuard { manager: self, key })
    }

    /// Stacks the pattern's files along Z, preserving source order (spec
    /// §4.1 `read_pattern`). Dtype is taken from the first plane; every
    /// plane must share it and share (height, width) (duplicate/mismatched
    /// planes are a configuration error per the open-question decision in
    /// `DESIGN.md`).
    pub fn read_pattern(&self, pattern: &Pattern, backend_id: &str) -> Result<RawImage> {
        let backend = self.backend(backend_id)?;
        if pattern.is_empty() {
            return Err(io_error!(backend_id, "<pattern>", "read_pattern", "pattern has no files"));
        }

        let mut planes = Vec::with_capacity(pattern.files.len());
        let mut dtype = None;
        let mut shape = None;
        for file in &pattern.files {
            let bytes = backend.load(&file.virtual_path)?;
            let plane: StoredPlane = bincode::deserialize(&bytes)
                .map_err(|e| io_error!(backend_id, file.virtual_path.clone(), "decode", e.to_string()))?;
            let dt = *dtype.get_or_insert(plane.dtype);
            if dt != plane.dtype {
                return Err(io_error!(
                    backend_id,
                    file.virtual_path.clone(),
                    "read_pattern",
                    "mixed dtypes within one pattern"
                ));
            }
            let sh = *shape.get_or_insert((plane.height, plane.width));
            if sh != (plane.height, plane.width) {
                return Err(io_error!(
                    backend_id,
                    file.virtual_path.clone(),
                    "read_pattern",
                    "mismatched plane dimensions within one pattern"
                ));
            }
            planes.push(plane);
        }

        let (height, width) = shape.unwrap();
        let z = planes.len();
        let mut array = Array3::<f32>::zeros((z, height, width));
        for (zi, plane) in planes.into_iter().enumerate() {
            let mut slice = array.index_axis_mut(ndarray::Axis(0), zi);
            for (idx, value) in plane.data.into_iter().enumerate() {
                let (y, x) = (idx / width, idx % width);
                slice[[y, x]] = value;
            }
        }

        Ok(RawImage { array, dtype: dtype.unwrap() })
    }

    /// Splits `image` along Z back to per-file entries, one per path in
    /// `virtual_paths` (spec §4.1 `write_pattern`). `virtual_paths.len()`
    /// must equal the Z extent.
    pub fn write_pattern(&self, image: &RawImage, virtual_paths: &[String], backend_id: &str) -> Result<()> {
        let backend = self.backend(backend_id)?;
        let (z, height, width) = image.array.dim();
        if virtual_paths.len() != z {
            return Err(io_error!(
                backend_id,
                "<pattern>",
                "write_pattern",
                format!("expected {} output paths for {} Z-planes, got {}", z, z, virtual_paths.len())
            ));
        }
        for (zi, path) in virtual_paths.iter().enumerate() {
            let _guard = self.begin_write(backend_id, path)?;
            let slice = image.array.index_axis(ndarray::Axis(0), zi);
            let mut data = Vec::with_capacity(height * width);
            for y in 0..height {
                for x in 0..width {
                    data.push(slice[[y, x]]);
                }
            }
            let plane = StoredPlane { dtype: image.dtype, height, width, data };
            let bytes = bincode::serialize(&plane)
                .map_err(|e| io_error!(backend_id, path.clone(), "encode", e.to_string()))?;
            backend.save(path, &bytes)?;
        }
        Ok(())
    }

    pub fn read_named(&self, name: &str, backend_id: &str) -> Result<NamedValue> {
        let backend = self.backend(backend_id)?;
        let bytes = backend.load(name)?;
        if let Ok(value) = serde_json::from_slice::<serde_json::Value>(&bytes) {
            Ok(NamedValue::Json(value))
        } else {
            Ok(NamedValue::Blob(bytes))
        }
    }

    pub fn write_named(&self, name: &str, value: &NamedValue, backend_id: &str) -> Result<()> {
        let backend = self.backend(backend_id)?;
        let _guard = self.begin_write(backend_id, name)?;
        let bytes = match value {
            NamedValue::Json(v) => serde_json::to_vec(v)?,
            NamedValue::Blob(b) => b.clone(),
        };
        backend.save(name, &bytes)
    }
}

impl Default for FileManager {
    fn default() -> Self {
        Self::new()
    }
}
