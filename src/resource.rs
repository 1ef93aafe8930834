//! Resource (C1): an immutable record of a content-addressed blob on disk.
//!
//! Grounded in `Resource.cpp`: a resource directory holds either a single
//! artifact file or an unpacked subtree, plus a `metadata.json` sidecar
//! that lets the bank survive restart without re-downloading.

use std::sync::atomic::{AtomicI64, Ordering};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

pub const METADATA_FILE_NAME: &str = "metadata.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ResourceMetadataFile {
    id: String,
    size: u64,
    name: String,
}

/// A Resource is owned by the Storage Manager and never exposed directly to
/// consumers; Requesters hold a `resource_id` and ask the Storage Manager
/// for the live path.
#[derive(Debug)]
pub struct Resource {
    id: String,
    directory: Utf8PathBuf,
    name: String,
    size_bytes: u64,
    ref_count: AtomicI64,
}

impl Resource {
    /// `Resource::create`: move `source_path` into `<working_dir>/<id>/`,
    /// compute its on-disk size, and write the sidecar.
    pub fn create(
        working_directory: &Utf8Path,
        id: &str,
        source_path: &Utf8Path,
    ) -> std::io::Result<Self> {
        let directory = working_directory.join(id);
        std::fs::create_dir_all(&directory)?;
        let name = source_path
            .file_name()
            .map(str::to_owned)
            .unwrap_or_else(|| "artifact".to_string());
        let destination = directory.join(&name);
        std::fs::rename(source_path, &destination)?;
        let size_bytes = directory_size(&destination)?;

        let resource = Self {
            id: id.to_string(),
            directory,
            name,
            size_bytes,
            ref_count: AtomicI64::new(0),
        };
        // Sidecar-write failure is non-fatal: metadata is reconstructed from
        // the directory contents on the next restart (see `create_from_storage`).
        let _ = resource.save_metadata();
        Ok(resource)
    }

    /// `Resource::createFromStorage`: reconstruct a Resource from a bank
    /// subdirectory, using the sidecar if present, else falling back to the
    /// single-file-in-directory convention. Returns `None` if the directory
    /// is unrecoverable (missing sidecar AND not exactly one entry).
    pub fn create_from_storage(directory: &Utf8Path) -> Option<Self> {
        let id = directory.file_name()?.to_string();
        let metadata_path = directory.join(METADATA_FILE_NAME);

        if let Ok(contents) = std::fs::read_to_string(&metadata_path) {
            if let Ok(meta) = serde_json::from_str::<ResourceMetadataFile>(&contents) {
                return Some(Self {
                    id: meta.id,
                    directory: directory.to_path_buf(),
                    name: meta.name,
                    size_bytes: meta.size,
                    ref_count: AtomicI64::new(0),
                });
            }
        }

        let mut entries: Vec<_> = std::fs::read_dir(directory)
            .ok()?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name() != METADATA_FILE_NAME)
            .collect();
        if entries.len() != 1 {
            return None;
        }
        let entry = entries.pop()?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let path = Utf8PathBuf::from_path_buf(entry.path()).ok()?;
        let size_bytes = directory_size(&path).ok()?;

        let resource = Self {
            id,
            directory: directory.to_path_buf(),
            name,
            size_bytes,
            ref_count: AtomicI64::new(0),
        };
        let _ = resource.save_metadata();
        Some(resource)
    }

    fn save_metadata(&self) -> std::io::Result<()> {
        let meta = ResourceMetadataFile {
            id: self.id.clone(),
            size: self.size_bytes,
            name: self.name.clone(),
        };
        let contents = serde_json::to_string(&meta)?;
        std::fs::write(self.directory.join(METADATA_FILE_NAME), contents)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> Utf8PathBuf {
        self.directory.join(&self.name)
    }

    pub fn directory(&self) -> &Utf8Path {
        &self.directory
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn ref_count(&self) -> i64 {
        self.ref_count.load(Ordering::SeqCst)
    }

    pub fn increment_ref_count(&self) -> i64 {
        self.ref_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Returns the ref count after decrementing.
    pub fn decrement_ref_count(&self) -> i64 {
        self.ref_count.fetch_sub(1, Ordering::SeqCst) - 1
    }

    /// `Resource::erase`: remove the on-disk directory. Idempotent.
    pub fn erase(&self) {
        let _ = std::fs::remove_dir_all(&self.directory);
    }
}

fn directory_size(path: &Utf8Path) -> std::io::Result<u64> {
    let metadata = std::fs::metadata(path)?;
    if metadata.is_file() {
        return Ok(metadata.len());
    }
    let mut total = 0u64;
    for entry in walkdir::WalkDir::new(path) {
        let entry = entry.map_err(std::io::Error::from)?;
        if entry.file_type().is_file() {
            total += entry.metadata().map_err(std::io::Error::from)?.len();
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_reload_from_storage_roundtrips() {
        let dir = camino_tempfile::tempdir().unwrap();
        let working = dir.path();
        let staged = working.join("staged_file");
        std::fs::write(&staged, b"hello world").unwrap();

        let resource = Resource::create(working, "abc123", &staged).unwrap();
        assert_eq!(resource.size_bytes(), 11);
        assert!(resource.path().exists());

        let reloaded = Resource::create_from_storage(&working.join("abc123")).unwrap();
        assert_eq!(reloaded.id(), "abc123");
        assert_eq!(reloaded.size_bytes(), 11);
    }

    #[test]
    fn create_from_storage_returns_none_for_ambiguous_directory() {
        let dir = camino_tempfile::tempdir().unwrap();
        let resource_dir = dir.path().join("weird");
        std::fs::create_dir_all(&resource_dir).unwrap();
        std::fs::write(resource_dir.join("a"), b"1").unwrap();
        std::fs::write(resource_dir.join("b"), b"2").unwrap();

        assert!(Resource::create_from_storage(&resource_dir).is_none());
    }

    #[test]
    fn ref_counting_reaches_zero() {
        let dir = camino_tempfile::tempdir().unwrap();
        let staged = dir.path().join("f");
        std::fs::write(&staged, b"x").unwrap();
        let resource = Resource::create(dir.path(), "id1", &staged).unwrap();
        resource.increment_ref_count();
        resource.increment_ref_count();
        assert_eq!(resource.decrement_ref_count(), 1);
        assert_eq!(resource.decrement_ref_count(), 0);
    }
}
