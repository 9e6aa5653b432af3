//! TestContext - owns the temporary directory of one test

use crate::{GraphStore, StoreConfig};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Temporary data directory removed on drop
///
/// Stores opened from the context must be dropped before it, which is what
/// happens naturally when the context is declared first.
pub struct TestContext {
    temp_dir: TempDir,
}

impl TestContext {
    /// Create a context with a unique, existing temporary directory
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temporary directory");
        std::fs::create_dir_all(temp_dir.path()).expect("Failed to create test directory");
        Self { temp_dir }
    }

    /// Path of the temporary directory
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Subdirectory of the context, created on demand
    pub fn create_dir(&self, name: &str) -> PathBuf {
        let dir = self.temp_dir.path().join(name);
        std::fs::create_dir_all(&dir).expect("Failed to create subdirectory");
        dir
    }

    /// Small-footprint configuration rooted at the context
    pub fn config(&self) -> StoreConfig {
        StoreConfig {
            initial_store_size: 64 * 1024,
            catalog_map_size: 8 * 1024 * 1024,
            lock_timeout_ms: 2_000,
            ..StoreConfig::with_data_dir(self.path().join("store"))
        }
    }

    /// Open (or reopen) the store of this context
    pub fn open_store(&self) -> GraphStore {
        GraphStore::open(self.config()).expect("Failed to open test store")
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}
