//! In-memory storage backend keyed by virtual path (spec §4.1). Grounded on
//! the teacher's `SessionManager` (`memory.rs`), which holds concurrent
//! state in a `DashMap<String, SessionState>` behind an `Arc`.

use super::{EntryMetadata, StorageBackend, WriteSink};
use crate::error::Result;
use crate::io_error;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;

struct Entry {
    bytes: Vec<u8>,
    created_at_unix: i64,
}

pub struct MemoryBackend {
    id: String,
    entries: Arc<DashMap<String, Entry>>,
}

impl MemoryBackend {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), entries: Arc::new(DashMap::new()) }
    }
}

struct MemoryWriteSink {
    backend: Arc<DashMap<String, Entry>>,
    path: String,
    buf: Vec<u8>,
}

impl WriteSink for MemoryWriteSink {
    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(buf);
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<()> {
        self.backend.insert(
            self.path,
            Entry { bytes: self.buf, created_at_unix: Utc::now().timestamp() },
        );
        Ok(())
    }
}

impl StorageBackend for MemoryBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn load(&self, path: &str) -> Result<Vec<u8>> {
        self.entries
            .get(path)
            .map(|e| e.bytes.clone())
            .ok_or_else(|| io_error!(self.id, path, "load", "path not found"))
    }

    fn save(&self, path: &str, data: &[u8]) -> Result<()> {
        self.entries.insert(
            path.to_string(),
            Entry { bytes: data.to_vec(), created_at_unix: Utc::now().timestamp() },
        );
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .entries
            .iter()
            .filter(|kv| kv.key().starts_with(prefix))
            .map(|kv| kv.key().clone())
            .collect())
    }

    fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.entries.contains_key(path))
    }

    fn delete(&self, path: &str) -> Result<()> {
        self.entries
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| io_error!(self.id, path, "delete", "path not found"))
    }

    fn open_writer(&self, path: &str) -> Result<Box<dyn WriteSink>> {
        Ok(Box::new(MemoryWriteSink {
            backend: self.entries.clone(),
            path: path.to_string(),
            buf: Vec::new(),
        }))
    }

    fn metadata(&self, path: &str) -> Result<EntryMetadata> {
        self.entries
            .get(path)
            .map(|e| EntryMetadata { size_bytes: e.bytes.len() as u64, created_at_unix: e.created_at_unix })
            .ok_or_else(|| io_error!(self.id, path, "metadata", "path not found"))
    }
}
