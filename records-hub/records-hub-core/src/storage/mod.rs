//! Persistent metadata storage.
//!
//! Items and grants are kept in memory and written through to one JSON file
//! per record under the data directory, which is reloaded on open.

pub mod disk;
pub mod items;

pub use items::{sort_for_display, ItemStore, TreeView};

use std::path::PathBuf;

/// Where the store keeps its records.
#[derive(Clone, Debug, Default)]
pub struct StoreConfig {
    data_dir: Option<PathBuf>,
}

impl StoreConfig {
    /// Nothing touches disk; state lives for the lifetime of the process.
    pub fn in_memory() -> Self {
        Self { data_dir: None }
    }

    /// Records are written under `dir` and reloaded on the next open.
    pub fn persistent(dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: Some(dir.into()),
        }
    }

    pub fn data_dir(&self) -> Option<&std::path::Path> {
        self.data_dir.as_deref()
    }

    pub fn items_dir(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|d| d.join("items"))
    }

    pub fn grants_dir(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|d| d.join("grants"))
    }

    pub fn history_dir(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|d| d.join("history"))
    }
}
