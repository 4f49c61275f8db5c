//! Artifact storage: hot object storage and the cold archive vault.

pub mod cold;
pub mod fs;
pub mod object_store;

pub use cold::{
    ColdStorage, ColdStorageError, InMemoryColdStorage, RetrievalLatency, RetrievalStatus,
    RetrievalTier,
};
pub use fs::FsObjectStore;
pub use object_store::{InMemoryObjectStore, ObjectStore, StorageError};
