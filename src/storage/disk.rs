//! On-disk storage backend rooted at a configurable workspace (spec §4.1).
//! Writes land via a temp-file-then-rename sequence so a crash mid-write
//! never leaves a torn file visible to readers — the same
//! scoped-acquisition-with-guaranteed-release shape the spec calls for
//! around writers generally (spec §9).

use super::{EntryMetadata, StorageBackend, WriteSink};
use crate::error::Result;
use crate::io_error;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub struct DiskBackend {
    id: String,
    root: PathBuf,
}

impl DiskBackend {
    pub fn new(id: impl Into<String>, root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { id: id.into(), root })
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let candidate = self.root.join(path);
        // Reject escapes out of the workspace root (spec §4.1 implies a
        // single rooted namespace per backend).
        let normalized = normalize(&candidate);
        if !normalized.starts_with(normalize(&self.root)) {
            return Err(io_error!(self.id, path, "resolve", "path escapes backend root"));
        }
        Ok(candidate)
    }
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            std::path::Component::ParentDir => {
                out.pop();
            }
            std::path::Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

struct DiskWriteSink {
    tmp_path: PathBuf,
    final_path: PathBuf,
    file: fs::File,
    backend_id: String,
}

impl WriteSink for DiskWriteSink {
    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.file
            .write_all(buf)
            .map_err(|e| io_error!(self.backend_id, self.final_path.display().to_string(), "write", e.to_string()))
    }

    fn finish(mut self: Box<Self>) -> Result<()> {
        self.file
            .flush()
            .map_err(|e| io_error!(self.backend_id, self.final_path.display().to_string(), "flush", e.to_string()))?;
        fs::rename(&self.tmp_path, &self.final_path).map_err(|e| {
            io_error!(self.backend_id, self.final_path.display().to_string(), "rename", e.to_string())
        })
    }
}

impl StorageBackend for DiskBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn load(&self, path: &str) -> Result<Vec<u8>> {
        let full = self.resolve(path)?;
        fs::read(&full).map_err(|e| io_error!(self.id, path, "load", e.to_string()))
    }

    fn save(&self, path: &str, data: &[u8]) -> Result<()> {
        let mut sink = self.open_writer(path)?;
        sink.write_all(data)?;
        sink.finish()
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = self.resolve(prefix)?;
        let mut out = Vec::new();
        if dir.is_dir() {
            for entry in fs::read_dir(&dir).map_err(|e| io_error!(self.id, prefix, "list", e.to_string()))? {
                let entry = entry.map_err(|e| io_error!(self.id, prefix, "list", e.to_string()))?;
                if let Ok(rel) = entry.path().strip_prefix(&self.root) {
                    out.push(rel.to_string_lossy().replace('\\', "/"));
                }
            }
        } else {
            // prefix may itself be a filename prefix within a parent dir
            if let Some(parent) = dir.parent() {
                if parent.is_dir() {
                    let stem = dir.file_name().map(|s| s.to_string_lossy().to_string()).unwrap_or_default();
                    for entry in fs::read_dir(parent).map_err(|e| io_error!(self.id, prefix, "list", e.to_string()))? {
                        let entry = entry.map_err(|e| io_error!(self.id, prefix, "list", e.to_string()))?;
                        let name = entry.file_name().to_string_lossy().to_string();
                        if name.starts_with(&stem) {
                            if let Ok(rel) = entry.path().strip_prefix(&self.root) {
                                out.push(rel.to_string_lossy().replace('\\', "/"));
                            }
                        }
                    }
                }
            }
        }
        out.sort();
        Ok(out)
    }

    fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.resolve(path)?.exists())
    }

    fn delete(&self, path: &str) -> Result<()> {
        let full = self.resolve(path)?;
        fs::remove_file(&full).map_err(|e| io_error!(self.id, path, "delete", e.to_string()))
    }

    fn open_writer(&self, path: &str) -> Result<Box<dyn WriteSink>> {
        let final_path = self.resolve(path)?;
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_error!(self.id, path, "mkdir", e.to_string()))?;
        }
        let tmp_path = final_path.with_extension(format!(
            "{}.tmp",
            final_path.extension().and_then(|e| e.to_str()).unwrap_or("part")
        ));
        let file = fs::File::create(&tmp_path).map_err(|e| io_error!(self.id, path, "create", e.to_string()))?;
        Ok(Box::new(DiskWriteSink { tmp_path, final_path, file, backend_id: self.id.clone() }))
    }

    fn metadata(&self, path: &str) -> Result<EntryMetadata> {
        let full = self.resolve(path)?;
        let meta = fs::metadata(&full).map_err(|e| io_error!(self.id, path, "metadata", e.to_string()))?;
        let created_at_unix = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        Ok(EntryMetadata { size_bytes: meta.len(), created_at_unix })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::assert_backend_contract;

    #[test]
    fn satisfies_shared_contract() {
        let dir = tempfile::tempdir().unwrap();
        let backend = DiskBackend::new("disk", dir.path()).unwrap();
        assert_backend_contract(&backend);
    }

    #[test]
    fn rejects_path_escape() {
        let dir = tempfile::tempdir().unwrap();
        let backend = DiskBackend::new("disk", dir.path()).unwrap();
        assert!(backend.save("../escape.bin", b"x").is_err());
    }
}
