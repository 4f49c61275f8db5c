//! Cold archive storage with tiered, asynchronous retrieval.
//!
//! Reading an archive is a two-step protocol: initiate a retrieval job for a
//! tier, poll its status until it reports `Succeeded`, then fetch the job
//! output. Faster tiers can be refused under capacity pressure.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use annotator_core::{ArchiveId, Clock, RetrievalJobId};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RetrievalTier {
    Expedited,
    Standard,
}

impl core::fmt::Display for RetrievalTier {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            RetrievalTier::Expedited => f.write_str("Expedited"),
            RetrievalTier::Standard => f.write_str("Standard"),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RetrievalStatus {
    InProgress,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ColdStorageError {
    /// The requested tier cannot take more retrievals right now.
    #[error("insufficient capacity for {0} retrieval")]
    InsufficientCapacity(RetrievalTier),

    #[error("archive not found: {0}")]
    ArchiveNotFound(ArchiveId),

    #[error("retrieval job not found: {0}")]
    RetrievalNotFound(RetrievalJobId),

    #[error("retrieval job {0} has no output yet")]
    RetrievalNotReady(RetrievalJobId),

    /// Network/throttling/service failure; retry later.
    #[error("cold storage service error: {0}")]
    Service(String),
}

pub trait ColdStorage: Send + Sync {
    fn upload_archive(&self, description: &str, bytes: &[u8]) -> Result<ArchiveId, ColdStorageError>;

    fn delete_archive(&self, archive_id: &ArchiveId) -> Result<(), ColdStorageError>;

    fn initiate_retrieval(
        &self,
        archive_id: &ArchiveId,
        tier: RetrievalTier,
    ) -> Result<RetrievalJobId, ColdStorageError>;

    /// Side-effect free status query.
    fn describe_retrieval(&self, job: &RetrievalJobId) -> Result<RetrievalStatus, ColdStorageError>;

    /// Output of a `Succeeded` retrieval.
    fn retrieval_output(&self, job: &RetrievalJobId) -> Result<Vec<u8>, ColdStorageError>;
}

impl<S> ColdStorage for Arc<S>
where
    S: ColdStorage + ?Sized,
{
    fn upload_archive(&self, description: &str, bytes: &[u8]) -> Result<ArchiveId, ColdStorageError> {
        (**self).upload_archive(description, bytes)
    }

    fn delete_archive(&self, archive_id: &ArchiveId) -> Result<(), ColdStorageError> {
        (**self).delete_archive(archive_id)
    }

    fn initiate_retrieval(
        &self,
        archive_id: &ArchiveId,
        tier: RetrievalTier,
    ) -> Result<RetrievalJobId, ColdStorageError> {
        (**self).initiate_retrieval(archive_id, tier)
    }

    fn describe_retrieval(&self, job: &RetrievalJobId) -> Result<RetrievalStatus, ColdStorageError> {
        (**self).describe_retrieval(job)
    }

    fn retrieval_output(&self, job: &RetrievalJobId) -> Result<Vec<u8>, ColdStorageError> {
        (**self).retrieval_output(job)
    }
}

/// How long a retrieval takes per tier.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RetrievalLatency {
    pub expedited: Duration,
    pub standard: Duration,
}

impl Default for RetrievalLatency {
    fn default() -> Self {
        Self {
            expedited: Duration::from_secs(5 * 60),
            standard: Duration::from_secs(4 * 60 * 60),
        }
    }
}

impl RetrievalLatency {
    pub fn for_tier(&self, tier: RetrievalTier) -> Duration {
        match tier {
            RetrievalTier::Expedited => self.expedited,
            RetrievalTier::Standard => self.standard,
        }
    }
}

#[derive(Debug, Clone)]
struct Retrieval {
    archive_id: ArchiveId,
    tier: RetrievalTier,
    output: Vec<u8>,
    ready_at: DateTime<Utc>,
    failed: bool,
}

/// In-memory vault for tests/dev.
///
/// - Ids are sequential (`A1`, `A2`, .. for archives, `R1`, .. for retrievals)
/// - A retrieval succeeds once the clock passes its tier latency
/// - Expedited capacity can be switched off to exercise tier fallback
pub struct InMemoryColdStorage {
    clock: Arc<dyn Clock>,
    latency: RetrievalLatency,
    archives: RwLock<HashMap<ArchiveId, Vec<u8>>>,
    retrievals: RwLock<HashMap<RetrievalJobId, Retrieval>>,
    next_archive: AtomicU64,
    next_retrieval: AtomicU64,
    expedited_capacity: AtomicBool,
    unavailable: AtomicBool,
}

impl core::fmt::Debug for InMemoryColdStorage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InMemoryColdStorage")
            .field("latency", &self.latency)
            .finish_non_exhaustive()
    }
}

fn poisoned() -> ColdStorageError {
    ColdStorageError::Service("cold storage lock poisoned".to_string())
}

impl InMemoryColdStorage {
    pub fn new(clock: Arc<dyn Clock>, latency: RetrievalLatency) -> Self {
        Self {
            clock,
            latency,
            archives: RwLock::new(HashMap::new()),
            retrievals: RwLock::new(HashMap::new()),
            next_archive: AtomicU64::new(1),
            next_retrieval: AtomicU64::new(1),
            expedited_capacity: AtomicBool::new(true),
            unavailable: AtomicBool::new(false),
        }
    }

    pub fn set_expedited_capacity(&self, available: bool) {
        self.expedited_capacity.store(available, Ordering::SeqCst);
    }

    /// Simulate an outage: every call fails with `Service`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Force a retrieval into the `Failed` state.
    pub fn fail_retrieval(&self, job: &RetrievalJobId) -> Result<(), ColdStorageError> {
        let mut retrievals = self.retrievals.write().map_err(|_| poisoned())?;
        let retrieval = retrievals
            .get_mut(job)
            .ok_or_else(|| ColdStorageError::RetrievalNotFound(job.clone()))?;
        retrieval.failed = true;
        Ok(())
    }

    pub fn contains_archive(&self, archive_id: &ArchiveId) -> bool {
        self.archives
            .read()
            .map(|a| a.contains_key(archive_id))
            .unwrap_or(false)
    }

    pub fn archive_count(&self) -> usize {
        self.archives.read().map(|a| a.len()).unwrap_or(0)
    }

    /// Tier each retrieval of `archive_id` was initiated with.
    pub fn retrieval_tiers(&self, archive_id: &ArchiveId) -> Vec<RetrievalTier> {
        let retrievals = match self.retrievals.read() {
            Ok(r) => r,
            Err(_) => return vec![],
        };
        retrievals
            .values()
            .filter(|r| &r.archive_id == archive_id)
            .map(|r| r.tier)
            .collect()
    }

    fn check_available(&self) -> Result<(), ColdStorageError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ColdStorageError::Service("cold storage unavailable".to_string()));
        }
        Ok(())
    }

    fn status_of(&self, retrieval: &Retrieval) -> RetrievalStatus {
        if retrieval.failed {
            RetrievalStatus::Failed
        } else if self.clock.now() >= retrieval.ready_at {
            RetrievalStatus::Succeeded
        } else {
            RetrievalStatus::InProgress
        }
    }
}

impl ColdStorage for InMemoryColdStorage {
    fn upload_archive(&self, description: &str, bytes: &[u8]) -> Result<ArchiveId, ColdStorageError> {
        self.check_available()?;
        let n = self.next_archive.fetch_add(1, Ordering::SeqCst);
        let archive_id = ArchiveId::new(format!("A{n}")).map_err(|e| ColdStorageError::Service(e.to_string()))?;

        let mut archives = self.archives.write().map_err(|_| poisoned())?;
        archives.insert(archive_id.clone(), bytes.to_vec());
        debug!(archive_id = %archive_id, description, size = bytes.len(), "archive uploaded");
        Ok(archive_id)
    }

    fn delete_archive(&self, archive_id: &ArchiveId) -> Result<(), ColdStorageError> {
        self.check_available()?;
        let mut archives = self.archives.write().map_err(|_| poisoned())?;
        archives
            .remove(archive_id)
            .map(|_| ())
            .ok_or_else(|| ColdStorageError::ArchiveNotFound(archive_id.clone()))
    }

    fn initiate_retrieval(
        &self,
        archive_id: &ArchiveId,
        tier: RetrievalTier,
    ) -> Result<RetrievalJobId, ColdStorageError> {
        self.check_available()?;
        if tier == RetrievalTier::Expedited && !self.expedited_capacity.load(Ordering::SeqCst) {
            return Err(ColdStorageError::InsufficientCapacity(tier));
        }

        let output = {
            let archives = self.archives.read().map_err(|_| poisoned())?;
            archives
                .get(archive_id)
                .cloned()
                .ok_or_else(|| ColdStorageError::ArchiveNotFound(archive_id.clone()))?
        };

        let n = self.next_retrieval.fetch_add(1, Ordering::SeqCst);
        let job = RetrievalJobId::new(format!("R{n}")).map_err(|e| ColdStorageError::Service(e.to_string()))?;
        let latency = chrono::Duration::from_std(self.latency.for_tier(tier))
            .unwrap_or(chrono::Duration::MAX);

        let mut retrievals = self.retrievals.write().map_err(|_| poisoned())?;
        retrievals.insert(
            job.clone(),
            Retrieval {
                archive_id: archive_id.clone(),
                tier,
                output,
                ready_at: self.clock.now() + latency,
                failed: false,
            },
        );
        Ok(job)
    }

    fn describe_retrieval(&self, job: &RetrievalJobId) -> Result<RetrievalStatus, ColdStorageError> {
        self.check_available()?;
        let retrievals = self.retrievals.read().map_err(|_| poisoned())?;
        let retrieval = retrievals
            .get(job)
            .ok_or_else(|| ColdStorageError::RetrievalNotFound(job.clone()))?;
        Ok(self.status_of(retrieval))
    }

    fn retrieval_output(&self, job: &RetrievalJobId) -> Result<Vec<u8>, ColdStorageError> {
        self.check_available()?;
        let retrievals = self.retrievals.read().map_err(|_| poisoned())?;
        let retrieval = retrievals
            .get(job)
            .ok_or_else(|| ColdStorageError::RetrievalNotFound(job.clone()))?;
        match self.status_of(retrieval) {
            RetrievalStatus::Succeeded => Ok(retrieval.output.clone()),
            _ => Err(ColdStorageError::RetrievalNotReady(job.clone())),
        }
    }
}
