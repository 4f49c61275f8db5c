//! Thaw worker: completes cold-storage retrievals.
//!
//! Polling a retrieval is done by lease backoff: while the job is in
//! progress the message is hidden for the backoff window and looked at again
//! when it reappears. Every step of the success path tolerates being
//! repeated, so a failure halfway through is fixed by redelivery.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument, warn};

use annotator_core::{JobId, JobUpdate, ObjectKey, RetrievalJobId};
use annotator_events::{ChannelError, Delivery, MessageChannel, RetrievalPendingEvent};
use annotator_infra::{
    ColdStorage, ColdStorageError, Disposition, JobRecordStore, MessageProcessor, ObjectStore,
    ProcessingError, RecordStoreError, RetrievalStatus, StorageError,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThawOutcome {
    /// Retrieval still running; the message returns after `backoff`.
    InProgress { job_id: JobId, backoff: Duration },
    Restored { job_id: JobId, key: ObjectKey, size: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum ThawError {
    #[error("retrieval {retrieval_id} for job {job_id} failed")]
    RetrievalFailed {
        job_id: JobId,
        retrieval_id: RetrievalJobId,
    },

    #[error("retrieval status query failed: {0}")]
    StatusQuery(#[source] ColdStorageError),

    #[error("failed to read retrieval output: {0}")]
    Output(#[source] ColdStorageError),

    #[error("failed to restore result to hot storage: {0}")]
    Storage(#[source] StorageError),

    #[error("failed to delete archive: {0}")]
    ArchiveDelete(#[source] ColdStorageError),

    #[error("no job record for {0}")]
    MissingRecord(JobId),

    #[error("record store error: {0}")]
    Records(#[source] RecordStoreError),

    #[error("channel error: {0}")]
    Channel(#[source] ChannelError),
}

impl ProcessingError for ThawError {
    fn disposition(&self) -> Disposition {
        match self {
            // Nothing retries these; the record keeps its archive_ref.
            ThawError::RetrievalFailed { .. } | ThawError::StatusQuery(_) | ThawError::MissingRecord(_) => {
                Disposition::Discard
            }
            _ => Disposition::Redeliver,
        }
    }
}

/// C5: polls retrievals and moves finished ones cold → hot.
pub struct ThawWorker {
    records: Arc<dyn JobRecordStore>,
    results: Arc<dyn ObjectStore>,
    vault: Arc<dyn ColdStorage>,
    retrievals: Arc<dyn MessageChannel>,
    backoff: Duration,
}

impl ThawWorker {
    pub fn new(
        records: Arc<dyn JobRecordStore>,
        results: Arc<dyn ObjectStore>,
        vault: Arc<dyn ColdStorage>,
        retrievals: Arc<dyn MessageChannel>,
        backoff: Duration,
    ) -> Self {
        Self {
            records,
            results,
            vault,
            retrievals,
            backoff,
        }
    }

    #[instrument(
        skip(self, delivery),
        fields(
            job_id = %delivery.message.annotation_job_id,
            retrieval_id = %delivery.message.restoration_job_id
        )
    )]
    pub fn process(&self, delivery: &Delivery<RetrievalPendingEvent>) -> Result<ThawOutcome, ThawError> {
        let event = &delivery.message;
        let job_id = event.annotation_job_id;

        let status = self
            .vault
            .describe_retrieval(&event.restoration_job_id)
            .map_err(ThawError::StatusQuery)?;

        match status {
            RetrievalStatus::InProgress => {
                self.retrievals
                    .extend_lease(&delivery.handle, self.backoff)
                    .map_err(ThawError::Channel)?;
                info!(backoff_secs = self.backoff.as_secs(), "retrieval in progress");
                Ok(ThawOutcome::InProgress {
                    job_id,
                    backoff: self.backoff,
                })
            }
            RetrievalStatus::Failed => Err(ThawError::RetrievalFailed {
                job_id,
                retrieval_id: event.restoration_job_id.clone(),
            }),
            RetrievalStatus::Succeeded => self.restore(delivery),
        }
    }

    fn restore(&self, delivery: &Delivery<RetrievalPendingEvent>) -> Result<ThawOutcome, ThawError> {
        let event = &delivery.message;
        let job_id = event.annotation_job_id;
        let key = &event.s3_key_result_file;

        let bytes = self
            .vault
            .retrieval_output(&event.restoration_job_id)
            .map_err(ThawError::Output)?;
        self.results.put(key, &bytes).map_err(ThawError::Storage)?;

        match self.vault.delete_archive(&event.archive_id) {
            Ok(()) => {}
            Err(ColdStorageError::ArchiveNotFound(_)) => {
                warn!(archive_id = %event.archive_id, "archive already deleted");
            }
            Err(e) => return Err(ThawError::ArchiveDelete(e)),
        }

        self.records
            .update(job_id, &JobUpdate::new().clear_archive_ref(), None)
            .map_err(|e| match e {
                RecordStoreError::NotFound(id) => ThawError::MissingRecord(id),
                other => ThawError::Records(other),
            })?;

        self.retrievals
            .delete(&delivery.handle)
            .map_err(ThawError::Channel)?;
        info!(key = %key, size = bytes.len(), "result restored");

        Ok(ThawOutcome::Restored {
            job_id,
            key: key.clone(),
            size: bytes.len(),
        })
    }
}

impl MessageProcessor for ThawWorker {
    type Message = RetrievalPendingEvent;
    type Outcome = ThawOutcome;
    type Error = ThawError;

    fn name(&self) -> &'static str {
        "thaw-worker"
    }

    fn channel(&self) -> &dyn MessageChannel {
        self.retrievals.as_ref()
    }

    fn process(&self, delivery: &Delivery<RetrievalPendingEvent>) -> Result<ThawOutcome, ThawError> {
        ThawWorker::process(self, delivery)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use annotator_core::{Clock, JobRecord, JobStatus, ManualClock, UserId, UserIdentity};
    use annotator_events::InMemoryQueue;
    use annotator_infra::{
        poll_once, InMemoryColdStorage, InMemoryJobRecordStore, InMemoryObjectStore, PollOutcome,
        RetrievalLatency, RetrievalTier,
    };
    use chrono::{TimeZone, Utc};

    const BACKOFF: Duration = Duration::from_secs(900);

    struct Fixture {
        clock: Arc<ManualClock>,
        records: Arc<InMemoryJobRecordStore>,
        results: Arc<InMemoryObjectStore>,
        vault: Arc<InMemoryColdStorage>,
        queue: Arc<InMemoryQueue>,
        worker: ThawWorker,
    }

    fn fixture() -> Fixture {
        let clock = ManualClock::arc(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
        let records = InMemoryJobRecordStore::arc();
        let results = InMemoryObjectStore::arc();
        let vault = Arc::new(InMemoryColdStorage::new(clock.clone(), RetrievalLatency::default()));
        let queue = InMemoryQueue::arc("thaw", clock.clone(), Duration::from_secs(30));
        let worker = ThawWorker::new(records.clone(), results.clone(), vault.clone(), queue.clone(), BACKOFF);
        Fixture {
            clock,
            records,
            results,
            vault,
            queue,
            worker,
        }
    }

    /// Archived job with a started retrieval, plus its pending event queued.
    fn retrieving(f: &Fixture) -> RetrievalPendingEvent {
        let job_id = JobId::new();
        let user = UserIdentity {
            user_id: UserId::new("u1").unwrap(),
            user_name: "Ada".to_string(),
            user_email: "ada@example.org".to_string(),
        };
        let input = ObjectKey::input("gas", &user.user_id, job_id, "s.vcf").unwrap();
        let result = ObjectKey::for_user("gas", &user.user_id, &format!("{job_id}~s.annot.vcf")).unwrap();
        let archive_id = f.vault.upload_archive("r", b"annotated").unwrap();

        let mut record = JobRecord::pending(job_id, user, input, f.clock.now());
        record.status = JobStatus::Completed;
        record.result_ref = Some(result.clone());
        record.archive_ref = Some(archive_id.clone());
        f.records.put(record).unwrap();

        let retrieval = f
            .vault
            .initiate_retrieval(&archive_id, RetrievalTier::Expedited)
            .unwrap();
        let event = RetrievalPendingEvent {
            annotation_job_id: job_id,
            restoration_job_id: retrieval,
            archive_id,
            s3_key_result_file: result,
        };
        f.queue.send(&event).unwrap();
        event
    }

    fn poll(f: &Fixture) -> PollOutcome<ThawOutcome, ThawError> {
        poll_once(&f.worker, Duration::ZERO).unwrap()
    }

    #[test]
    fn in_progress_backs_off() {
        let f = fixture();
        retrieving(&f);

        assert!(matches!(
            poll(&f),
            PollOutcome::Processed(ThawOutcome::InProgress { backoff, .. }) if backoff == BACKOFF
        ));
        let snap = f.queue.snapshot();
        assert_eq!(snap[0].visible_at, f.clock.now() + chrono::Duration::seconds(900));
    }

    #[test]
    fn succeeded_restores_and_clears_archive_ref() {
        let f = fixture();
        let event = retrieving(&f);
        f.clock.advance(chrono::Duration::minutes(5));

        assert!(matches!(poll(&f), PollOutcome::Processed(ThawOutcome::Restored { size: 9, .. })));
        assert_eq!(f.results.get(&event.s3_key_result_file).unwrap(), b"annotated");
        assert!(!f.vault.contains_archive(&event.archive_id));
        assert!(!f.records.get(event.annotation_job_id).unwrap().unwrap().is_archived());
        assert!(f.queue.is_empty());
    }

    #[test]
    fn repeated_success_path_is_harmless() {
        let f = fixture();
        let event = retrieving(&f);
        f.queue.send(&event).unwrap();
        f.clock.advance(chrono::Duration::minutes(5));

        poll(&f);
        assert!(matches!(poll(&f), PollOutcome::Processed(ThawOutcome::Restored { .. })));
        assert_eq!(f.results.get(&event.s3_key_result_file).unwrap(), b"annotated");
        assert!(f.queue.is_empty());
    }

    #[test]
    fn hot_write_failure_is_retried() {
        let f = fixture();
        let event = retrieving(&f);
        f.clock.advance(chrono::Duration::minutes(5));
        f.results.set_unavailable(true);

        assert!(matches!(
            poll(&f),
            PollOutcome::Failed {
                error: ThawError::Storage(_),
                disposition: Disposition::Redeliver
            }
        ));
        assert!(f.vault.contains_archive(&event.archive_id));
        assert_eq!(f.queue.len(), 1);
    }

    #[test]
    fn failed_retrieval_is_dropped_and_stays_archived() {
        let f = fixture();
        let event = retrieving(&f);
        f.vault.fail_retrieval(&event.restoration_job_id).unwrap();

        assert!(matches!(
            poll(&f),
            PollOutcome::Failed {
                error: ThawError::RetrievalFailed { .. },
                disposition: Disposition::Discard
            }
        ));
        assert!(f.queue.is_empty());
        assert!(f.records.get(event.annotation_job_id).unwrap().unwrap().is_archived());
    }

    #[test]
    fn status_query_error_is_dropped_and_stays_archived() {
        let f = fixture();
        let event = retrieving(&f);
        f.vault.set_unavailable(true);

        assert!(matches!(
            poll(&f),
            PollOutcome::Failed {
                error: ThawError::StatusQuery(ColdStorageError::Service(_)),
                disposition: Disposition::Discard
            }
        ));
        assert!(f.queue.is_empty());
        let record = f.records.get(event.annotation_job_id).unwrap().unwrap();
        assert_eq!(record.archive_ref, Some(event.archive_id.clone()));
        assert!(!f.results.exists(&event.s3_key_result_file).unwrap());
    }
}
