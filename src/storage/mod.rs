//! Storage backends (spec §4.1). `StorageBackend` is a capability interface
//! (spec §9) with three concrete implementations: in-memory, on-disk, and a
//! chunked compressed archive. No inheritance hierarchy — callers hold a
//! `Box<dyn StorageBackend>` / `Arc<dyn StorageBackend>` per backend id,
//! the same pattern as the teacher's `Arc<RwLock<..>>`-held component
//! instances in `turbulance/orchestrator.rs`.

pub mod archive;
pub mod disk;
pub mod memory;

use crate::error::Result;
use serde::{Deserialize, Serialize};

/// Metadata about a stored entry, independent of backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub size_bytes: u64,
    pub created_at_unix: i64,
}

/// A streaming write handle. Implementors must flush and finalize on
/// `finish`; any write failure before `finish` leaves no entry visible to
/// readers (spec §4.1 "at-most-one writer").
pub trait WriteSink: Send {
    fn write_all(&mut self, buf: &[u8]) -> Result<()>;
    fn finish(self: Box<Self>) -> Result<()>;
}

/// Uniform abstraction over in-memory, on-disk, and archive storage (spec
/// §4.1). Every operation is addressed by a virtual path, scoped to
/// whichever `(backend_id, path)` namespace the `FileManager` resolved it
/// from.
pub trait StorageBackend: Send + Sync {
    fn id(&self) -> &str;

    fn load(&self, path: &str) -> Result<Vec<u8>>;
    fn save(&self, path: &str, data: &[u8]) -> Result<()>;
    fn list(&self, prefix: &str) -> Result<Vec<String>>;
    fn exists(&self, path: &str) -> Result<bool>;
    fn delete(&self, path: &str) -> Result<()>;
    fn open_writer(&self, path: &str) -> Result<Box<dyn WriteSink>>;
    fn metadata(&self, path: &str) -> Result<EntryMetadata>;
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Runs the shared contract every backend must satisfy, parameterized
    /// over a backend factory so each concrete backend's test module can
    /// reuse it without duplicating the round-trip assertions.
    pub fn assert_backend_contract(backend: &dyn StorageBackend) {
        let path = "well_a01/site_1.bin";
        assert!(!backend.exists(path).unwrap());

        backend.save(path, b"hello").unwrap();
        assert!(backend.exists(path).unwrap());
        assert_eq!(backend.load(path).unwrap(), b"hello");

        let meta = backend.metadata(path).unwrap();
        assert_eq!(meta.size_bytes, 5);

        let listed = backend.list("well_a01/").unwrap();
        assert!(listed.iter().any(|p| p == path));

        backend.delete(path).unwrap();
        assert!(!backend.exists(path).unwrap());
    }
}
