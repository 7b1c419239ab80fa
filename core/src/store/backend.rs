// Key/value storage behind the client's snapshot persistence

use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Minimal byte-oriented store. Errors are plain strings; callers treat
/// every storage failure as best-effort.
pub trait StorageBackend: Send + Sync {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), String>;
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, String>;
    fn remove(&self, key: &[u8]) -> Result<(), String>;
    fn flush(&self) -> Result<(), String>;
}

/// In-memory storage for tests and short-lived clients
#[derive(Clone, Default)]
pub struct MemoryStorage {
    data: Arc<RwLock<HashMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

impl StorageBackend for MemoryStorage {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), String> {
        self.data.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, String> {
        Ok(self.data.read().get(key).cloned())
    }

    fn remove(&self, key: &[u8]) -> Result<(), String> {
        self.data.write().remove(key);
        Ok(())
    }

    fn flush(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Sled-backed storage that survives restarts
pub struct SledStorage {
    db: sled::Db,
}

impl SledStorage {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, String> {
        let db = sled::open(path).map_err(|e| e.to_string())?;
        Ok(Self { db })
    }
}

impl StorageBackend for SledStorage {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), String> {
        self.db.insert(key, value).map_err(|e| e.to_string())?;
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, String> {
        let value = self.db.get(key).map_err(|e| e.to_string())?;
        Ok(value.map(|ivec| ivec.to_vec()))
    }

    fn remove(&self, key: &[u8]) -> Result<(), String> {
        self.db.remove(key).map_err(|e| e.to_string())?;
        Ok(())
    }

    fn flush(&self) -> Result<(), String> {
        self.db.flush().map_err(|e| e.to_string())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_memory_put_get_remove() {
        let storage = MemoryStorage::new();
        storage.put(b"k", b"v1").unwrap();
        storage.put(b"k", b"v2").unwrap();
        assert_eq!(storage.get(b"k").unwrap(), Some(b"v2".to_vec()));
        assert_eq!(storage.len(), 1);

        storage.remove(b"k").unwrap();
        assert_eq!(storage.get(b"k").unwrap(), None);
        assert!(storage.is_empty());
    }

    #[test]
    fn test_memory_clones_share_data() {
        let storage = MemoryStorage::new();
        let other = storage.clone();
        storage.put(b"k", b"v").unwrap();
        assert_eq!(other.get(b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_sled_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("snapshots");

        {
            let storage = SledStorage::new(&path).unwrap();
            storage.put(b"last", b"{}").unwrap();
            storage.flush().unwrap();
        }

        let storage = SledStorage::new(&path).unwrap();
        assert_eq!(storage.get(b"last").unwrap(), Some(b"{}".to_vec()));
        storage.remove(b"last").unwrap();
        assert_eq!(storage.get(b"last").unwrap(), None);
    }
}
