use crate::error::Result;
use serde::{de::DeserializeOwned, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// A directory holding one `<uuid>.json` file per record.
pub struct RecordDir {
    dir: PathBuf,
}

impl RecordDir {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    /// Load every record in the directory. Files whose stem is not a UUID are
    /// ignored; unreadable records are skipped with a warning.
    pub fn load_all<T: DeserializeOwned>(&self) -> Result<Vec<T>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if Uuid::parse_str(stem).is_err() {
                continue;
            }
            let data = fs::read(&path)?;
            match serde_json::from_slice(&data) {
                Ok(record) => out.push(record),
                Err(err) => {
                    tracing::warn!(path = %path.display(), %err, "skipping unreadable record")
                }
            }
        }
        Ok(out)
    }

    /// Write a record atomically: temp file, fsync, rename.
    pub fn write<T: Serialize>(&self, id: Uuid, record: &T) -> Result<()> {
        let path = self.record_path(id);
        let tmp = path.with_extension("tmp");
        {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(&serde_json::to_vec_pretty(record)?)?;
            file.sync_data()?;
        }
        fs::rename(tmp, path)?;
        Ok(())
    }
}
