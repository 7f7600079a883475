//! Content storage behind `file_ref`.
//!
//! Items only ever hold an opaque reference; the bytes live in a
//! [`BlobStore`].

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use uuid::Uuid;

pub trait BlobStore: Send + Sync {
    /// Store `data` and return the reference to record on the item.
    fn put(&self, data: &[u8]) -> Result<String>;
    fn fetch(&self, file_ref: &str) -> Result<Vec<u8>>;
    fn remove(&self, file_ref: &str) -> Result<()>;
}

/// Blob store kept in process memory; used by tests.
#[derive(Default)]
pub struct InMemoryBlobStore {
    data: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlobStore for InMemoryBlobStore {
    fn put(&self, data: &[u8]) -> Result<String> {
        let file_ref = Uuid::new_v4().to_string();
        self.data.lock().insert(file_ref.clone(), data.to_vec());
        Ok(file_ref)
    }

    fn fetch(&self, file_ref: &str) -> Result<Vec<u8>> {
        self.data
            .lock()
            .get(file_ref)
            .cloned()
            .ok_or_else(|| anyhow!("blob {file_ref} not found"))
    }

    fn remove(&self, file_ref: &str) -> Result<()> {
        self.data.lock().remove(file_ref);
        Ok(())
    }
}

/// Filesystem-backed store writing one file per blob under a directory.
pub struct FsBlobStore {
    dir: PathBuf,
}

impl FsBlobStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, file_ref: &str) -> Result<PathBuf> {
        // refs are uuids we minted; anything else could escape the directory
        let id = Uuid::parse_str(file_ref).map_err(|_| anyhow!("malformed blob ref {file_ref}"))?;
        Ok(self.dir.join(id.to_string()))
    }
}

impl BlobStore for FsBlobStore {
    fn put(&self, data: &[u8]) -> Result<String> {
        let file_ref = Uuid::new_v4().to_string();
        std::fs::write(self.path_for(&file_ref)?, data)?;
        Ok(file_ref)
    }

    fn fetch(&self, file_ref: &str) -> Result<Vec<u8>> {
        Ok(std::fs::read(self.path_for(file_ref)?)?)
    }

    fn remove(&self, file_ref: &str) -> Result<()> {
        let path = self.path_for(file_ref)?;
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(store: &dyn BlobStore) {
        let r = store.put(b"cbc results").unwrap();
        assert_eq!(store.fetch(&r).unwrap(), b"cbc results");
        store.remove(&r).unwrap();
        assert!(store.fetch(&r).is_err());
    }

    #[test]
    fn in_memory_store() {
        exercise(&InMemoryBlobStore::new());
    }

    #[test]
    fn fs_store_rejects_foreign_refs() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path()).unwrap();
        exercise(&store);
        assert!(store.fetch("../etc/passwd").is_err());
    }
}
