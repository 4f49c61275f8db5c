use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};
use proptest::prelude::*;

use annotator_core::{JobId, JobRecord, JobStatus, ManualClock, SubscriptionTier, UserId, UserIdentity};
use annotator_events::{MessageChannel, RetrievalPendingEvent};
use annotator_infra::{
    poll_once, InMemoryColdStorage, InMemoryObjectStore, JobRecordStore, ObjectStore, PipelineConfig, PollOutcome,
    PollWorker, ProfileDirectory, RecordingLauncher, RetrievalLatency, RetrievalTier,
};
use annotator_pipeline::{
    AnnotationTask, ArchiveOutcome, CountingAnnotator, DispatchOutcome, LocalPipeline, ThawOutcome,
};

const VCF: &[u8] = b"##fileformat=VCFv4.1\n#CHROM\tPOS\tID\tREF\tALT\n1\t10177\t.\tA\tAC\n1\t10235\t.\tT\tTA\n";

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

fn ada() -> UserIdentity {
    UserIdentity {
        user_id: UserId::new("u1").unwrap(),
        user_name: "Ada".to_string(),
        user_email: "ada@example.org".to_string(),
    }
}

struct Harness {
    _work: tempfile::TempDir,
    clock: Arc<ManualClock>,
    objects: Arc<InMemoryObjectStore>,
    vault: Arc<InMemoryColdStorage>,
    launcher: Arc<RecordingLauncher<AnnotationTask>>,
    pipeline: LocalPipeline,
}

impl Harness {
    fn new(latency: RetrievalLatency) -> Self {
        let work = tempfile::tempdir().unwrap();
        let clock = ManualClock::arc(t0());
        let objects = InMemoryObjectStore::arc();
        let vault = Arc::new(InMemoryColdStorage::new(clock.clone(), latency));
        let config = PipelineConfig {
            key_prefix: "gas".to_string(),
            work_dir: work.path().to_path_buf(),
            ..PipelineConfig::default()
        };
        let pipeline = LocalPipeline::new(config, clock.clone(), objects.clone(), vault.clone());
        Self {
            _work: work,
            clock,
            objects,
            vault,
            launcher: RecordingLauncher::arc(),
            pipeline,
        }
    }

    fn advance_to(&self, offset: chrono::Duration) {
        self.clock.set(t0() + offset);
    }

    /// Submit, dispatch and run one job for a user of `tier`; returns the
    /// completed record.
    fn complete_job(&self, tier: SubscriptionTier) -> JobRecord {
        let user = ada();
        self.pipeline.profiles.set_tier(&user.user_id, tier).unwrap();
        let submitted = self.pipeline.intake().submit_job(&user, "sample.vcf", VCF).unwrap();

        let dispatcher = self.pipeline.dispatcher(self.launcher.clone());
        let outcome = poll_once(&dispatcher, Duration::ZERO).unwrap();
        assert!(matches!(outcome, PollOutcome::Processed(DispatchOutcome::Launched { .. })));

        let runner = self.pipeline.runner(Arc::new(CountingAnnotator));
        for task in self.launcher.drain() {
            runner.run(&task).unwrap();
        }

        let record = self.pipeline.records.get(submitted.job_id).unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        record
    }

    fn archive(&self) -> PollOutcome<ArchiveOutcome, annotator_pipeline::ArchiveError> {
        poll_once(&self.pipeline.archive_worker(), Duration::ZERO).unwrap()
    }

    fn thaw(&self) -> PollOutcome<ThawOutcome, annotator_pipeline::ThawError> {
        poll_once(&self.pipeline.thaw_worker(), Duration::ZERO).unwrap()
    }

    fn record(&self, job_id: JobId) -> JobRecord {
        self.pipeline.records.get(job_id).unwrap().unwrap()
    }
}

#[test]
fn free_job_is_archived_then_restored_after_upgrade() {
    let h = Harness::new(RetrievalLatency {
        expedited: Duration::from_secs(30 * 60),
        standard: Duration::from_secs(4 * 60 * 60),
    });

    let job = h.complete_job(SubscriptionTier::Free);
    assert_eq!(job.complete_time, Some(t0()));
    let result_key = job.result_ref.clone().unwrap();
    let annotated = h.objects.get(&result_key).unwrap();

    // t = 4 min: inside the grace window.
    h.advance_to(chrono::Duration::minutes(4));
    let PollOutcome::Processed(ArchiveOutcome::Deferred { remaining, .. }) = h.archive() else {
        panic!("expected deferral at 4 min");
    };
    assert!(remaining >= Duration::from_secs(60));
    assert!(matches!(h.archive(), PollOutcome::Idle));

    // t = 6 min: archived.
    h.advance_to(chrono::Duration::minutes(6));
    let PollOutcome::Processed(ArchiveOutcome::Archived { archive_id, .. }) = h.archive() else {
        panic!("expected archive at 6 min");
    };
    assert_eq!(archive_id.as_str(), "A1");
    assert!(!h.objects.exists(&result_key).unwrap());

    let stored = serde_json::to_value(h.record(job.job_id)).unwrap();
    assert_eq!(stored["results_file_archive_id"], "A1");
    assert_eq!(stored["job_status"], "COMPLETED");

    // t = 10 min: upgrade.
    h.advance_to(chrono::Duration::minutes(10));
    h.pipeline.intake().request_upgrade(&job.user_id).unwrap();
    let PollOutcome::Processed(report) = poll_once(&h.pipeline.restore_initiator(), Duration::ZERO).unwrap() else {
        panic!("expected restore report");
    };
    assert_eq!(report.initiated.len(), 1);
    assert_eq!(report.initiated[0].job_id, job.job_id);
    assert_eq!(report.initiated[0].archive_id.as_str(), "A1");

    let pending = h.pipeline.thaw_queue.snapshot();
    assert_eq!(pending.len(), 1);

    // Retrieval takes 30 min: two backoffs, then success.
    let mut backoffs = 0;
    loop {
        match h.thaw() {
            PollOutcome::Processed(ThawOutcome::InProgress { backoff, .. }) => {
                assert_eq!(backoff, Duration::from_secs(900));
                backoffs += 1;
                h.clock.advance(chrono::Duration::seconds(900));
            }
            PollOutcome::Processed(ThawOutcome::Restored { key, .. }) => {
                assert_eq!(key, result_key);
                break;
            }
            other => panic!("unexpected thaw outcome: {other:?}"),
        }
    }
    assert_eq!(backoffs, 2);

    assert_eq!(h.objects.get(&result_key).unwrap(), annotated);
    assert!(!h.record(job.job_id).is_archived());
    assert!(!h.vault.contains_archive(&archive_id));
    assert!(h.pipeline.thaw_queue.is_empty());
    assert!(h.pipeline.archive_queue.is_empty());
}

#[test]
fn grace_boundary_is_inclusive() {
    let h = Harness::new(RetrievalLatency::default());
    let job = h.complete_job(SubscriptionTier::Free);

    h.advance_to(chrono::Duration::seconds(299));
    let PollOutcome::Processed(ArchiveOutcome::Deferred { remaining, .. }) = h.archive() else {
        panic!("expected deferral one second before the boundary");
    };
    assert_eq!(remaining, Duration::from_secs(1));

    h.advance_to(chrono::Duration::seconds(300));
    assert!(matches!(
        h.archive(),
        PollOutcome::Processed(ArchiveOutcome::Archived { .. })
    ));
    assert!(h.record(job.job_id).is_archived());
}

#[test]
fn standard_tier_used_when_expedited_is_exhausted() {
    let h = Harness::new(RetrievalLatency::default());
    let job = h.complete_job(SubscriptionTier::Free);
    h.advance_to(chrono::Duration::minutes(5));
    h.archive();
    let archive_id = h.record(job.job_id).archive_ref.unwrap();

    h.vault.set_expedited_capacity(false);
    h.pipeline.intake().request_upgrade(&job.user_id).unwrap();
    let PollOutcome::Processed(report) = poll_once(&h.pipeline.restore_initiator(), Duration::ZERO).unwrap() else {
        panic!("expected restore report");
    };
    assert_eq!(report.initiated[0].tier, RetrievalTier::Standard);
    assert_eq!(h.vault.retrieval_tiers(&archive_id), vec![RetrievalTier::Standard]);

    let event = h
        .pipeline
        .thaw_queue
        .receive(Duration::ZERO)
        .unwrap()
        .unwrap()
        .decode::<RetrievalPendingEvent>()
        .unwrap();
    assert_eq!(event.message.annotation_job_id, job.job_id);
    assert_eq!(event.message.archive_id, archive_id);
}

#[test]
fn premium_results_are_never_archived() {
    let h = Harness::new(RetrievalLatency::default());
    let job = h.complete_job(SubscriptionTier::Premium);
    h.advance_to(chrono::Duration::hours(2));

    assert!(matches!(
        h.archive(),
        PollOutcome::Processed(ArchiveOutcome::Premium { .. })
    ));
    assert!(h.objects.exists(job.result_ref.as_ref().unwrap()).unwrap());
    assert_eq!(h.vault.archive_count(), 0);
}

#[test]
fn poll_workers_run_the_pipeline_end_to_end() {
    let work = tempfile::tempdir().unwrap();
    let clock = ManualClock::arc(t0());
    let objects = InMemoryObjectStore::arc();
    let vault = Arc::new(InMemoryColdStorage::new(clock.clone(), RetrievalLatency::default()));
    let config = PipelineConfig {
        work_dir: work.path().to_path_buf(),
        ..PipelineConfig::default()
    };
    let pipeline = LocalPipeline::new(config, clock.clone(), objects.clone(), vault);

    let user = ada();
    pipeline.profiles.set_tier(&user.user_id, SubscriptionTier::Premium).unwrap();
    let launcher = Arc::new(pipeline.runner(Arc::new(CountingAnnotator)).into_launcher());

    let wait = Duration::from_millis(20);
    let workers = vec![
        PollWorker::spawn(pipeline.dispatcher(launcher), wait).unwrap(),
        PollWorker::spawn(pipeline.archive_worker(), wait).unwrap(),
    ];

    let job = pipeline.intake().submit_job(&user, "sample.vcf", VCF).unwrap();

    // The completion event is the runner's last message; cleanup follows it.
    let job_dir = work.path().join(job.job_id.to_string());
    let deadline = Instant::now() + Duration::from_secs(10);
    while workers[1].stats().processed == 0 || job_dir.exists() {
        assert!(Instant::now() < deadline, "job did not complete in time");
        std::thread::sleep(Duration::from_millis(10));
    }

    let stats: Vec<_> = workers.into_iter().map(|w| w.shutdown()).collect();
    // The runner may finish before the dispatcher's RUNNING update lands, in
    // which case that update loses the race and the request is discarded.
    assert_eq!(stats[0].processed + stats[0].failed, 1);
    assert_eq!(stats[1].processed, 1);

    let record = pipeline.records.get(job.job_id).unwrap().unwrap();
    let annotated = objects.get(record.result_ref.as_ref().unwrap()).unwrap();
    assert_eq!(record.status, JobStatus::Completed);
    assert!(String::from_utf8(annotated).unwrap().contains("##annotation=annotator-counting"));
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 32, .. ProptestConfig::default() })]

    #[test]
    fn redelivered_requests_launch_once(copies in 1usize..6) {
        let h = Harness::new(RetrievalLatency::default());
        let user = ada();
        h.pipeline.profiles.set_tier(&user.user_id, SubscriptionTier::Free).unwrap();
        let job = h.pipeline.intake().submit_job(&user, "sample.vcf", VCF).unwrap();

        let request = h.pipeline.request_queue.snapshot()[0].body.clone();
        for _ in 1..copies {
            h.pipeline.request_queue.send_raw(request.clone()).unwrap();
        }

        let dispatcher = h.pipeline.dispatcher(h.launcher.clone());
        while let PollOutcome::Processed(_) | PollOutcome::Failed { .. } = poll_once(&dispatcher, Duration::ZERO).unwrap() {}

        prop_assert_eq!(h.launcher.launched().len(), 1);
        prop_assert_eq!(h.record(job.job_id).status, JobStatus::Running);
        prop_assert!(h.pipeline.request_queue.is_empty());
    }
}
