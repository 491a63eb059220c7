//! Chunked, zstd-compressed archive backend (spec §4.1, §6 "Archive
//! layout"). Two chunking strategies: `Well` (one chunk per well, optimized
//! for sequential whole-well scans) and `File` (one chunk per original
//! file, optimized for random access). A JSON sidecar carries chunk index
//! plus a reserved `openhcs.*` metadata namespace (grid dimensions, pixel
//! size, channel names).

use crate::config::ChunkStrategy;
use crate::error::Result;
use crate::io_error;
use crate::storage::{EntryMetadata, StorageBackend, WriteSink};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChunkRecord {
    /// Byte offset of each member's compressed payload within the chunk blob.
    members: Vec<(String, u64, u64)>, // (virtual_path, offset, compressed_len)
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct ArchiveIndex {
    /// chunk_key -> record
    chunks: std::collections::BTreeMap<String, ChunkRecord>,
    /// reserved `openhcs.*` namespace
    metadata: std::collections::BTreeMap<String, String>,
}

pub struct ArchiveBackend {
    id: String,
    root: PathBuf,
    strategy: ChunkStrategy,
    compression_level: i32,
    index: Arc<Mutex<ArchiveIndex>>,
    /// decompressed member cache so repeated reads within a well's
    /// execution don't re-inflate the whole chunk (spec §4.1 "sequential
    /// whole-well scans" optimization).
    cache: Arc<DashMap<String, Vec<u8>>>,
}

impl ArchiveBackend {
    pub fn open(
        id: impl Into<String>,
        root: impl Into<PathBuf>,
        strategy: ChunkStrategy,
        compression_level: i32,
    ) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let index_path = root.join("index.json");
        let index = if index_path.exists() {
            let bytes = fs::read(&index_path)?;
            serde_json::from_slice(&bytes)?
        } else {
            ArchiveIndex::default()
        };
        Ok(Self {
            id: id.into(),
            root,
            strategy,
            compression_level,
            index: Arc::new(Mutex::new(index)),
            cache: Arc::new(DashMap::new()),
        })
    }

    fn chunk_key(&self, path: &str) -> String {
        match self.strategy {
            ChunkStrategy::Well => path.split('/').next().unwrap_or(path).to_string(),
            ChunkStrategy::File => path.to_string(),
        }
    }

    fn chunk_blob_path(&self, chunk_key: &str) -> PathBuf {
        self.root.join(format!("{}.chunk", sanitize(chunk_key)))
    }

    fn persist_index(&self) -> Result<()> {
        let index = self.index.lock();
        let bytes = serde_json::to_vec_pretty(&*index)?;
        fs::write(self.root.join("index.json"), bytes)?;
        Ok(())
    }

    /// Sets a reserved `openhcs.*` metadata entry (spec §6 "Archive layout").
    pub fn set_openhcs_metadata(&self, key: &str, value: &str) -> Result<()> {
        {
            let mut index = self.index.lock();
            index.metadata.insert(format!("openhcs.{key}"), value.to_string());
        }
        self.persist_index()
    }

    pub fn get_openhcs_metadata(&self, key: &str) -> Option<String> {
        self.index.lock().metadata.get(&format!("openhcs.{key}")).cloned()
    }

    fn read_member(&self, chunk_key: &str, path: &str) -> Result<Vec<u8>> {
        if let Some(cached) = self.cache.get(path) {
            return Ok(cached.clone());
        }
        let (offset, len) = {
            let index = self.index.lock();
            let record = index
                .chunks
                .get(chunk_key)
                .ok_or_else(|| io_error!(self.id, path, "load", "chunk not found"))?;
            record
                .members
                .iter()
                .find(|(p, _, _)| p == path)
                .map(|(_, o, l)| (*o, *l))
                .ok_or_else(|| io_error!(self.id, path, "load", "member not found in chunk"))?
        };
        let blob = fs::read(self.chunk_blob_path(chunk_key))
            .map_err(|e| io_error!(self.id, path, "load", e.to_string()))?;
        let compressed = &blob[offset as usize..(offset + len) as usize];
        let decompressed =
            zstd::stream::decode_all(compressed).map_err(|e| io_error!(self.id, path, "decompress", e.to_string()))?;
        self.cache.insert(path.to_string(), decompressed.clone());
        Ok(decompressed)
    }

    fn write_member(&self, chunk_key: &str, path: &str, data: &[u8]) -> Result<()> {
        write_member_to(
            &self.id,
            &self.root,
            self.compression_level,
            &self.index,
            &self.cache,
            chunk_key,
            path,
            data,
        )
    }
}

/// Compresses `data`, appends it to the chunk blob, and records its offset
/// in the index. Shared by `ArchiveBackend::save` and `open_writer`'s sink
/// so the two paths can't drift out of sync.
fn write_member_to(
    id: &str,
    root: &std::path::Path,
    compression_level: i32,
    index: &Mutex<ArchiveIndex>,
    cache: &DashMap<String, Vec<u8>>,
    chunk_key: &str,
    path: &str,
    data: &[u8],
) -> Result<()> {
    let compressed = zstd::stream::encode_all(data, compression_level)
        .map_err(|e| io_error!(id, path, "compress", e.to_string()))?;
    let blob_path = root.join(format!("{}.chunk", sanitize(chunk_key)));
    let offset = fs::metadata(&blob_path).map(|m| m.len()).unwrap_or(0);
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&blob_path)
        .map_err(|e| io_error!(id, path, "append", e.to_string()))?;
    use std::io::Write;
    file.write_all(&compressed).map_err(|e| io_error!(id, path, "append", e.to_string()))?;

    {
        let mut idx = index.lock();
        let record = idx.chunks.entry(chunk_key.to_string()).or_insert_with(|| ChunkRecord { members: Vec::new() });
        record.members.retain(|(p, _, _)| p != path);
        record.members.push((path.to_string(), offset, compressed.len() as u64));
        let bytes = serde_json::to_vec_pretty(&*idx)?;
        drop(idx);
        fs::write(root.join("index.json"), bytes)?;
    }
    cache.insert(path.to_string(), data.to_vec());
    Ok(())
}

fn sanitize(key: &str) -> String {
    key.chars().map(|c| if c.is_alphanumeric() || c == '_' || c == '-' { c } else { '_' }).collect()
}

struct ArchiveWriteSink {
    id: String,
    root: PathBuf,
    compression_level: i32,
    index: Arc<Mutex<ArchiveIndex>>,
    cache: Arc<DashMap<String, Vec<u8>>>,
    chunk_key: String,
    path: String,
    buf: Vec<u8>,
}

impl WriteSink for ArchiveWriteSink {
    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(buf);
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<()> {
        write_member_to(
            &self.id,
            &self.root,
            self.compression_level,
            &self.index,
            &self.cache,
            &self.chunk_key,
            &self.path,
            &self.buf,
        )
    }
}

impl StorageBackend for ArchiveBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn load(&self, path: &str) -> Result<Vec<u8>> {
        self.read_member(&self.chunk_key(path), path)
    }

    fn save(&self, path: &str, data: &[u8]) -> Result<()> {
        self.write_member(&self.chunk_key(path), path, data)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let index = self.index.lock();
        let mut out: Vec<String> = index
            .chunks
            .values()
            .flat_map(|r| r.members.iter().map(|(p, _, _)| p.clone()))
            .filter(|p| p.starts_with(prefix))
            .collect();
        out.sort();
        out.dedup();
        Ok(out)
    }

    fn exists(&self, path: &str) -> Result<bool> {
        let index = self.index.lock();
        Ok(index
            .chunks
            .get(&self.chunk_key(path))
            .map(|r| r.members.iter().any(|(p, _, _)| p == path))
            .unwrap_or(false))
    }

    fn delete(&self, path: &str) -> Result<()> {
        // Archives are append-only blobs; deletion removes the index entry
        // only. The blob is compacted on the next full-well rewrite, which
        // is outside this module's scope.
        let chunk_key = self.chunk_key(path);
        let mut index = self.index.lock();
        let record = index
            .chunks
            .get_mut(&chunk_key)
            .ok_or_else(|| io_error!(self.id, path, "delete", "chunk not found"))?;
        let before = record.members.len();
        record.members.retain(|(p, _, _)| p != path);
        if record.members.len() == before {
            return Err(io_error!(self.id, path, "delete", "member not found"));
        }
        drop(index);
        self.cache.remove(path);
        self.persist_index()
    }

    fn open_writer(&self, path: &str) -> Result<Box<dyn WriteSink>> {
        Ok(Box::new(ArchiveWriteSink {
            id: self.id.clone(),
            root: self.root.clone(),
            compression_level: self.compression_level,
            index: self.index.clone(),
            cache: self.cache.clone(),
            chunk_key: self.chunk_key(path),
            path: path.to_string(),
            buf: Vec::new(),
        }))
    }

    fn metadata(&self, path: &str) -> Result<EntryMetadata> {
        let data = self.load(path)?;
        Ok(EntryMetadata { size_bytes: data.len() as u64, created_at_unix: chrono::Utc::now().timestamp() })
    }
}
