//! Key-Value Storage Module
//!
//! Durable per-key JSON storage backing the session store.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, error, info};

/// File-backed key-value store under the platform local-data directory.
///
/// Each key maps to one JSON file; values are any serde-serializable type.
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    /// Create a store rooted at the default application data directory.
    pub fn new() -> Self {
        let root = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("LocTrack");
        Self::at(root)
    }

    /// Create a store rooted at an explicit directory.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        let root = root.into();

        if let Err(e) = std::fs::create_dir_all(&root) {
            error!("Failed to create storage directory: {}", e);
        }

        debug!("Storage initialized at: {:?}", root);

        Self { root }
    }

    /// Persist a value under a key.
    pub fn save<T: Serialize>(&self, key: &str, data: &T) -> Result<(), StorageError> {
        let json =
            serde_json::to_string(data).map_err(|e| StorageError::Serialization(e.to_string()))?;

        let file_path = self.entry_path(key);
        std::fs::write(&file_path, json).map_err(|e| StorageError::Io(e.to_string()))?;

        debug!("Saved data for key: {}", key);
        Ok(())
    }

    /// Load the value stored under a key.
    pub fn load<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Result<T, StorageError> {
        let file_path = self.entry_path(key);

        let json =
            std::fs::read_to_string(&file_path).map_err(|e| StorageError::Io(e.to_string()))?;

        serde_json::from_str(&json).map_err(|e| StorageError::Serialization(e.to_string()))
    }

    /// Delete stored data
    pub fn delete(&self, key: &str) -> Result<(), StorageError> {
        let file_path = self.entry_path(key);

        if file_path.exists() {
            std::fs::remove_file(&file_path).map_err(|e| StorageError::Io(e.to_string()))?;
            info!("Deleted stored data for key: {}", key);
        }

        Ok(())
    }

    /// Check if key exists
    pub fn exists(&self, key: &str) -> bool {
        self.entry_path(key).exists()
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.json", key))
    }
}

impl Default for Storage {
    fn default() -> Self {
        Self::new()
    }
}

/// Storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_storage() -> (tempfile::TempDir, Storage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::at(dir.path());
        (dir, storage)
    }

    #[test]
    fn save_and_load_round_trip() {
        let (_dir, storage) = temp_storage();

        storage.save("token", &"abc123".to_string()).unwrap();
        let loaded: String = storage.load("token").unwrap();
        assert_eq!(loaded, "abc123");
    }

    #[test]
    fn load_missing_key_is_io_error() {
        let (_dir, storage) = temp_storage();

        let result: Result<String, _> = storage.load("nope");
        assert!(matches!(result, Err(StorageError::Io(_))));
    }

    #[test]
    fn delete_removes_key() {
        let (_dir, storage) = temp_storage();

        storage.save("token", &"abc".to_string()).unwrap();
        assert!(storage.exists("token"));

        storage.delete("token").unwrap();
        assert!(!storage.exists("token"));
    }

    #[test]
    fn delete_missing_key_is_ok() {
        let (_dir, storage) = temp_storage();
        assert!(storage.delete("ghost").is_ok());
    }
}
