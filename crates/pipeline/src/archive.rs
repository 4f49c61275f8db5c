//! Archive worker: moves free-tier results to cold storage once their grace
//! period is over.
//!
//! The grace period is enforced without timers: a completion event that
//! arrives too early has its lease extended to the end of the window and is
//! simply seen again later.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument, warn};

use annotator_core::{ArchiveId, Clock, GraceDecision, GracePolicy, JobId, JobUpdate, ObjectKey, UserId};
use annotator_events::{ChannelError, CompletionEvent, Delivery, MessageChannel};
use annotator_infra::{
    ColdStorage, ColdStorageError, Disposition, JobRecordStore, MessageProcessor, ObjectStore,
    ProcessingError, ProfileDirectory, ProfileError, RecordStoreError, StorageError,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveOutcome {
    /// Premium results stay hot.
    Premium { job_id: JobId },
    /// Still inside the grace window; the event returns after `remaining`.
    Deferred { job_id: JobId, remaining: Duration },
    Archived { job_id: JobId, archive_id: ArchiveId },
    /// A previous delivery already archived this job.
    AlreadyArchived { job_id: JobId, archive_id: ArchiveId },
}

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("no job record for {0}")]
    MissingRecord(JobId),

    #[error("unknown user {0}")]
    UnknownUser(UserId),

    #[error("profile lookup failed: {0}")]
    Profile(#[source] ProfileError),

    #[error("result {0} is missing from hot storage")]
    ResultMissing(ObjectKey),

    #[error("hot storage error: {0}")]
    Storage(#[source] StorageError),

    #[error("archive write failed: {0}")]
    ArchiveWrite(#[source] ColdStorageError),

    #[error("record store error: {0}")]
    Records(#[source] RecordStoreError),

    #[error("channel error: {0}")]
    Channel(#[source] ChannelError),
}

impl ProcessingError for ArchiveError {
    fn disposition(&self) -> Disposition {
        match self {
            ArchiveError::MissingRecord(_) | ArchiveError::UnknownUser(_) | ArchiveError::ResultMissing(_) => {
                Disposition::Discard
            }
            _ => Disposition::Redeliver,
        }
    }
}

/// C3: grace-period enforcement and hot → cold archival.
pub struct ArchiveWorker {
    records: Arc<dyn JobRecordStore>,
    results: Arc<dyn ObjectStore>,
    vault: Arc<dyn ColdStorage>,
    profiles: Arc<dyn ProfileDirectory>,
    completions: Arc<dyn MessageChannel>,
    clock: Arc<dyn Clock>,
    policy: GracePolicy,
}

impl ArchiveWorker {
    pub fn new(
        records: Arc<dyn JobRecordStore>,
        results: Arc<dyn ObjectStore>,
        vault: Arc<dyn ColdStorage>,
        profiles: Arc<dyn ProfileDirectory>,
        completions: Arc<dyn MessageChannel>,
        clock: Arc<dyn Clock>,
        policy: GracePolicy,
    ) -> Self {
        Self {
            records,
            results,
            vault,
            profiles,
            completions,
            clock,
            policy,
        }
    }

    #[instrument(
        skip(self, delivery),
        fields(job_id = %delivery.message.job_id, user_id = %delivery.message.user_id)
    )]
    pub fn process(&self, delivery: &Delivery<CompletionEvent>) -> Result<ArchiveOutcome, ArchiveError> {
        let event = &delivery.message;
        let job_id = event.job_id;

        let tier = self.profiles.tier(&event.user_id).map_err(|e| match e {
            ProfileError::UnknownUser(user) => ArchiveError::UnknownUser(user),
            other => ArchiveError::Profile(other),
        })?;

        if tier.is_premium() {
            self.ack(delivery)?;
            return Ok(ArchiveOutcome::Premium { job_id });
        }

        if let GraceDecision::Defer { remaining } = self.policy.evaluate(event.complete_time, self.clock.now()) {
            self.completions
                .extend_lease(&delivery.handle, remaining)
                .map_err(ArchiveError::Channel)?;
            info!(remaining_secs = remaining.as_secs(), "inside grace period; deferred");
            return Ok(ArchiveOutcome::Deferred { job_id, remaining });
        }

        let record = self
            .records
            .get(job_id)
            .map_err(ArchiveError::Records)?
            .ok_or(ArchiveError::MissingRecord(job_id))?;
        let key = &event.s3_key_result_file;

        if let Some(archive_id) = record.archive_ref {
            // The hot delete may not have happened on the first attempt.
            self.results.delete(key).map_err(ArchiveError::Storage)?;
            self.ack(delivery)?;
            info!(%archive_id, "already archived");
            return Ok(ArchiveOutcome::AlreadyArchived { job_id, archive_id });
        }

        let bytes = self.results.get(key).map_err(|e| match e {
            StorageError::NotFound(key) => ArchiveError::ResultMissing(key),
            other => ArchiveError::Storage(other),
        })?;

        let archive_id = self
            .vault
            .upload_archive(key.as_str(), &bytes)
            .map_err(ArchiveError::ArchiveWrite)?;

        let update = JobUpdate::new().archive_ref(archive_id.clone());
        if let Err(err) = self.records.update(job_id, &update, None) {
            if let Err(cleanup) = self.vault.delete_archive(&archive_id) {
                warn!(%archive_id, error = %cleanup, "failed to delete orphaned archive");
            }
            return Err(match err {
                RecordStoreError::NotFound(id) => ArchiveError::MissingRecord(id),
                other => ArchiveError::Records(other),
            });
        }

        self.results.delete(key).map_err(ArchiveError::Storage)?;
        self.ack(delivery)?;
        info!(%archive_id, size = bytes.len(), "result archived");

        Ok(ArchiveOutcome::Archived { job_id, archive_id })
    }

    fn ack(&self, delivery: &Delivery<CompletionEvent>) -> Result<(), ArchiveError> {
        self.completions
            .delete(&delivery.handle)
            .map_err(ArchiveError::Channel)
    }
}

impl MessageProcessor for ArchiveWorker {
    type Message = CompletionEvent;
    type Outcome = ArchiveOutcome;
    type Error = ArchiveError;

    fn name(&self) -> &'static str {
        "archive-worker"
    }

    fn channel(&self) -> &dyn MessageChannel {
        self.completions.as_ref()
    }

    fn process(&self, delivery: &Delivery<CompletionEvent>) -> Result<ArchiveOutcome, ArchiveError> {
        ArchiveWorker::process(self, delivery)
    }
}
