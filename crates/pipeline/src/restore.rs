//! Restore initiator: starts cold-storage retrievals for an upgraded user.

use std::sync::Arc;

use tracing::{info, instrument, warn};

use annotator_core::{ArchiveId, JobId, JobRecord, RetrievalJobId, UserId};
use annotator_events::{ChannelError, Delivery, EventPublisher, MessageChannel, RetrievalPendingEvent, UpgradeEvent};
use annotator_infra::{
    ColdStorage, ColdStorageError, Disposition, JobRecordStore, MessageProcessor, ProcessingError,
    RecordStoreError, RetrievalTier,
};

/// One retrieval started for an archived job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitiatedRetrieval {
    pub job_id: JobId,
    pub archive_id: ArchiveId,
    pub retrieval_id: RetrievalJobId,
    pub tier: RetrievalTier,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedRetrieval {
    pub job_id: JobId,
    pub reason: String,
}

/// Outcome of one upgrade event.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RestoreReport {
    pub initiated: Vec<InitiatedRetrieval>,
    pub failed: Vec<FailedRetrieval>,
}

#[derive(Debug, thiserror::Error)]
pub enum RestoreError {
    #[error("failed to query jobs of {user_id}: {source}")]
    Query {
        user_id: UserId,
        #[source]
        source: RecordStoreError,
    },

    #[error("failed to ack upgrade: {0}")]
    Ack(#[source] ChannelError),
}

impl ProcessingError for RestoreError {
    fn disposition(&self) -> Disposition {
        Disposition::Redeliver
    }
}

/// C4: initiates tiered retrievals for every archived job of an upgraded user.
pub struct RestoreInitiator {
    records: Arc<dyn JobRecordStore>,
    vault: Arc<dyn ColdStorage>,
    upgrades: Arc<dyn MessageChannel>,
    pending: Arc<dyn EventPublisher<RetrievalPendingEvent>>,
}

impl RestoreInitiator {
    pub fn new(
        records: Arc<dyn JobRecordStore>,
        vault: Arc<dyn ColdStorage>,
        upgrades: Arc<dyn MessageChannel>,
        pending: Arc<dyn EventPublisher<RetrievalPendingEvent>>,
    ) -> Self {
        Self {
            records,
            vault,
            upgrades,
            pending,
        }
    }

    #[instrument(skip(self, delivery), fields(user_id = %delivery.message.user_id))]
    pub fn process(&self, delivery: &Delivery<UpgradeEvent>) -> Result<RestoreReport, RestoreError> {
        let user_id = &delivery.message.user_id;
        let jobs = self
            .records
            .query_by_user(user_id)
            .map_err(|source| RestoreError::Query {
                user_id: user_id.clone(),
                source,
            })?;

        let mut report = RestoreReport::default();
        for record in jobs.iter().filter(|r| r.is_archived()) {
            match self.restore(record) {
                Ok(initiated) => report.initiated.push(initiated),
                Err(reason) => {
                    warn!(job_id = %record.job_id, %reason, "failed to initiate retrieval");
                    report.failed.push(FailedRetrieval {
                        job_id: record.job_id,
                        reason,
                    });
                }
            }
        }

        self.upgrades
            .delete(&delivery.handle)
            .map_err(RestoreError::Ack)?;
        info!(
            initiated = report.initiated.len(),
            failed = report.failed.len(),
            "upgrade processed"
        );
        Ok(report)
    }

    fn restore(&self, record: &JobRecord) -> Result<InitiatedRetrieval, String> {
        let (Some(archive_id), Some(result_ref)) = (&record.archive_ref, &record.result_ref) else {
            return Err("archived record has no result key".to_string());
        };

        let (retrieval_id, tier) = self
            .initiate(archive_id)
            .map_err(|e| e.to_string())?;

        let event = RetrievalPendingEvent {
            annotation_job_id: record.job_id,
            restoration_job_id: retrieval_id.clone(),
            archive_id: archive_id.clone(),
            s3_key_result_file: result_ref.clone(),
        };
        self.pending.publish(&event).map_err(|e| e.to_string())?;

        info!(job_id = %record.job_id, %retrieval_id, %tier, "retrieval initiated");
        Ok(InitiatedRetrieval {
            job_id: record.job_id,
            archive_id: archive_id.clone(),
            retrieval_id,
            tier,
        })
    }

    /// Expedited first; Standard when expedited capacity is exhausted.
    fn initiate(&self, archive_id: &ArchiveId) -> Result<(RetrievalJobId, RetrievalTier), ColdStorageError> {
        match self.vault.initiate_retrieval(archive_id, RetrievalTier::Expedited) {
            Ok(id) => Ok((id, RetrievalTier::Expedited)),
            Err(ColdStorageError::InsufficientCapacity(_)) => {
                info!(%archive_id, "expedited capacity exhausted; falling back to standard");
                let id = self.vault.initiate_retrieval(archive_id, RetrievalTier::Standard)?;
                Ok((id, RetrievalTier::Standard))
            }
            Err(e) => Err(e),
        }
    }
}

impl MessageProcessor for RestoreInitiator {
    type Message = UpgradeEvent;
    type Outcome = RestoreReport;
    type Error = RestoreError;

    fn name(&self) -> &'static str {
        "restore-initiator"
    }

    fn channel(&self) -> &dyn MessageChannel {
        self.upgrades.as_ref()
    }

    fn process(&self, delivery: &Delivery<UpgradeEvent>) -> Result<RestoreReport, RestoreError> {
        RestoreInitiator::process(self, delivery)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use annotator_core::{JobStatus, JobUpdate, ManualClock, ObjectKey, UserIdentity};
    use annotator_events::{InMemoryQueue, InMemoryTopic};
    use annotator_infra::{
        poll_once, InMemoryColdStorage, InMemoryJobRecordStore, PollOutcome, RetrievalLatency,
    };
    use chrono::{TimeZone, Utc};

    struct Fixture {
        records: Arc<InMemoryJobRecordStore>,
        vault: Arc<InMemoryColdStorage>,
        upgrades: Arc<InMemoryQueue>,
        thaw: Arc<InMemoryQueue>,
        initiator: RestoreInitiator,
    }

    fn fixture() -> Fixture {
        let clock = ManualClock::arc(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
        let records = InMemoryJobRecordStore::arc();
        let vault = Arc::new(InMemoryColdStorage::new(clock.clone(), RetrievalLatency::default()));
        let upgrades = InMemoryQueue::arc("restore", clock.clone(), Duration::from_secs(30));
        let thaw = InMemoryQueue::arc("thaw", clock, Duration::from_secs(30));
        let topic = Arc::new(InMemoryTopic::new("retrievals"));
        topic.subscribe(thaw.clone());

        let initiator = RestoreInitiator::new(records.clone(), vault.clone(), upgrades.clone(), topic);
        Fixture {
            records,
            vault,
            upgrades,
            thaw,
            initiator,
        }
    }

    fn user() -> UserIdentity {
        UserIdentity {
            user_id: UserId::new("u1").unwrap(),
            user_name: "Ada".to_string(),
            user_email: "ada@example.org".to_string(),
        }
    }

    /// A completed job, archived when `archived` is set.
    fn job(f: &Fixture, archived: bool) -> JobRecord {
        let job_id = JobId::new();
        let input = ObjectKey::input("gas", &user().user_id, job_id, "s.vcf").unwrap();
        let result = ObjectKey::for_user("gas", &user().user_id, &format!("{job_id}~s.annot.vcf")).unwrap();
        f.records
            .put(JobRecord::pending(job_id, user(), input, Utc::now()))
            .unwrap();

        let mut update = JobUpdate::new()
            .status(JobStatus::Completed)
            .result_ref(result)
            .complete_time(Utc::now());
        if archived {
            let archive_id = f.vault.upload_archive("r", b"annotated").unwrap();
            update = update.archive_ref(archive_id);
        }
        f.records.update(job_id, &update, None).unwrap()
    }

    fn upgrade(f: &Fixture) {
        f.upgrades.send(&UpgradeEvent { user_id: user().user_id }).unwrap();
    }

    fn pending_events(f: &Fixture) -> Vec<RetrievalPendingEvent> {
        std::iter::from_fn(|| f.thaw.receive(Duration::ZERO).unwrap())
            .map(|m| m.decode::<RetrievalPendingEvent>().unwrap().message)
            .collect()
    }

    #[test]
    fn initiates_expedited_for_each_archived_job() {
        let f = fixture();
        let archived = job(&f, true);
        job(&f, false);
        upgrade(&f);

        let PollOutcome::Processed(report) = poll_once(&f.initiator, Duration::ZERO).unwrap() else {
            panic!("expected report");
        };
        assert_eq!(report.initiated.len(), 1);
        assert_eq!(report.initiated[0].tier, RetrievalTier::Expedited);
        assert!(report.failed.is_empty());

        let events = pending_events(&f);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].annotation_job_id, archived.job_id);
        assert_eq!(Some(&events[0].archive_id), archived.archive_ref.as_ref());
        assert_eq!(Some(&events[0].s3_key_result_file), archived.result_ref.as_ref());
        assert!(f.upgrades.is_empty());
    }

    #[test]
    fn falls_back_to_standard_without_expedited_capacity() {
        let f = fixture();
        let archived = job(&f, true);
        f.vault.set_expedited_capacity(false);
        upgrade(&f);

        let PollOutcome::Processed(report) = poll_once(&f.initiator, Duration::ZERO).unwrap() else {
            panic!("expected report");
        };
        assert_eq!(report.initiated[0].tier, RetrievalTier::Standard);
        let archive_id = archived.archive_ref.unwrap();
        assert_eq!(f.vault.retrieval_tiers(&archive_id), vec![RetrievalTier::Standard]);
        assert_eq!(pending_events(&f).len(), 1);
    }

    #[test]
    fn per_job_failure_does_not_block_the_batch() {
        let f = fixture();
        let broken = job(&f, true);
        let healthy = job(&f, true);
        f.vault.delete_archive(broken.archive_ref.as_ref().unwrap()).unwrap();
        upgrade(&f);

        let PollOutcome::Processed(report) = poll_once(&f.initiator, Duration::ZERO).unwrap() else {
            panic!("expected report");
        };
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].job_id, broken.job_id);
        assert_eq!(report.initiated.len(), 1);
        assert_eq!(report.initiated[0].job_id, healthy.job_id);
        assert!(f.upgrades.is_empty());
    }

    #[test]
    fn query_failure_leaves_upgrade_queued() {
        let f = fixture();
        upgrade(&f);
        f.records.set_unavailable(true);

        assert!(matches!(
            poll_once(&f.initiator, Duration::ZERO).unwrap(),
            PollOutcome::Failed {
                error: RestoreError::Query { .. },
                disposition: Disposition::Redeliver
            }
        ));
        assert_eq!(f.upgrades.len(), 1);
    }
}
