//! Infrastructure layer: record store, hot/cold storage, profiles, config,
//! task launching and the generic poll-loop worker.

pub mod config;
pub mod launcher;
pub mod profiles;
pub mod records;
pub mod storage;
pub mod workers;

pub use config::{ConfigError, PipelineConfig};
pub use launcher::{LaunchError, RecordingLauncher, TaskLauncher, ThreadLauncher};
pub use profiles::{InMemoryProfileDirectory, ProfileDirectory, ProfileError};
pub use records::{InMemoryJobRecordStore, JobRecordStore, RecordStoreError};
pub use storage::{
    ColdStorage, ColdStorageError, FsObjectStore, InMemoryColdStorage, InMemoryObjectStore, ObjectStore,
    RetrievalLatency, RetrievalStatus, RetrievalTier, StorageError,
};
pub use workers::{
    poll_once, Disposition, MessageProcessor, PollOutcome, PollWorker, ProcessingError, WorkerHandle,
    WorkerStats,
};
