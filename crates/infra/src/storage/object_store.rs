//! Hot object storage.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use annotator_core::ObjectKey;

/// Keyed blob storage for inputs, results and logs.
pub trait ObjectStore: Send + Sync {
    fn get(&self, key: &ObjectKey) -> Result<Vec<u8>, StorageError>;

    fn put(&self, key: &ObjectKey, bytes: &[u8]) -> Result<(), StorageError>;

    /// Deleting a missing object succeeds.
    fn delete(&self, key: &ObjectKey) -> Result<(), StorageError>;

    fn exists(&self, key: &ObjectKey) -> Result<bool, StorageError>;

    /// Copy an object into a local file, returning the byte count.
    fn download_to(&self, key: &ObjectKey, dest: &Path) -> Result<u64, StorageError> {
        let bytes = self.get(key)?;
        std::fs::write(dest, &bytes).map_err(|e| StorageError::io(dest, e))?;
        Ok(bytes.len() as u64)
    }

    /// Upload a local file, returning the byte count.
    fn upload_from(&self, src: &Path, key: &ObjectKey) -> Result<u64, StorageError> {
        let bytes = std::fs::read(src).map_err(|e| StorageError::io(src, e))?;
        self.put(key, &bytes)?;
        Ok(bytes.len() as u64)
    }
}

impl<S> ObjectStore for Arc<S>
where
    S: ObjectStore + ?Sized,
{
    fn get(&self, key: &ObjectKey) -> Result<Vec<u8>, StorageError> {
        (**self).get(key)
    }

    fn put(&self, key: &ObjectKey, bytes: &[u8]) -> Result<(), StorageError> {
        (**self).put(key, bytes)
    }

    fn delete(&self, key: &ObjectKey) -> Result<(), StorageError> {
        (**self).delete(key)
    }

    fn exists(&self, key: &ObjectKey) -> Result<bool, StorageError> {
        (**self).exists(key)
    }

    fn download_to(&self, key: &ObjectKey, dest: &Path) -> Result<u64, StorageError> {
        (**self).download_to(key, dest)
    }

    fn upload_from(&self, src: &Path, key: &ObjectKey) -> Result<u64, StorageError> {
        (**self).upload_from(src, key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(ObjectKey),

    #[error("key cannot be stored: {0}")]
    InvalidKey(String),

    /// Local filesystem failure.
    #[error("io error: {0}")]
    Io(String),

    /// Network/throttling/service failure; retry later.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl StorageError {
    pub fn io(path: &Path, err: std::io::Error) -> Self {
        Self::Io(format!("{}: {}", path.display(), err))
    }
}

/// In-memory object store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    objects: RwLock<HashMap<ObjectKey, Vec<u8>>>,
    unavailable: AtomicBool,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Simulate an outage: every call fails with `Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn keys(&self) -> Vec<ObjectKey> {
        let mut keys: Vec<_> = self
            .objects
            .read()
            .map(|o| o.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    fn check_available(&self) -> Result<(), StorageError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("object store unavailable".to_string()));
        }
        Ok(())
    }
}

fn poisoned() -> StorageError {
    StorageError::Unavailable("object store lock poisoned".to_string())
}

impl ObjectStore for InMemoryObjectStore {
    fn get(&self, key: &ObjectKey) -> Result<Vec<u8>, StorageError> {
        self.check_available()?;
        let objects = self.objects.read().map_err(|_| poisoned())?;
        objects
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.clone()))
    }

    fn put(&self, key: &ObjectKey, bytes: &[u8]) -> Result<(), StorageError> {
        self.check_available()?;
        let mut objects = self.objects.write().map_err(|_| poisoned())?;
        objects.insert(key.clone(), bytes.to_vec());
        Ok(())
    }

    fn delete(&self, key: &ObjectKey) -> Result<(), StorageError> {
        self.check_available()?;
        let mut objects = self.objects.write().map_err(|_| poisoned())?;
        objects.remove(key);
        Ok(())
    }

    fn exists(&self, key: &ObjectKey) -> Result<bool, StorageError> {
        self.check_available()?;
        let objects = self.objects.read().map_err(|_| poisoned())?;
        Ok(objects.contains_key(key))
    }
}
