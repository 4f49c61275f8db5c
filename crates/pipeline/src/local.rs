//! Single-process wiring of the pipeline over in-memory channels.
//!
//! Topics and queues:
//!
//! ```text
//! job-requests ──► requests  (dispatcher)
//! job-results  ──► archive   (archive worker)
//! upgrades     ──► restore   (restore initiator)
//! retrievals   ──► thaw      (thaw worker)
//! ```

use std::sync::Arc;

use annotator_core::Clock;
use annotator_events::InMemoryQueue;
use annotator_events::InMemoryTopic;
use annotator_infra::{
    ColdStorage, InMemoryJobRecordStore, InMemoryProfileDirectory, ObjectStore, PipelineConfig, TaskLauncher,
};

use crate::archive::ArchiveWorker;
use crate::dispatcher::{AnnotationTask, Dispatcher};
use crate::intake::Intake;
use crate::restore::RestoreInitiator;
use crate::runner::{Annotator, Runner};
use crate::thaw::ThawWorker;

/// Shared adapters of a local pipeline; components are built on demand.
pub struct LocalPipeline {
    pub config: PipelineConfig,
    pub clock: Arc<dyn Clock>,
    pub records: Arc<InMemoryJobRecordStore>,
    pub profiles: Arc<InMemoryProfileDirectory>,
    pub objects: Arc<dyn ObjectStore>,
    pub vault: Arc<dyn ColdStorage>,

    pub job_requests: Arc<InMemoryTopic>,
    pub job_results: Arc<InMemoryTopic>,
    pub upgrades: Arc<InMemoryTopic>,
    pub retrievals: Arc<InMemoryTopic>,

    pub request_queue: Arc<InMemoryQueue>,
    pub archive_queue: Arc<InMemoryQueue>,
    pub restore_queue: Arc<InMemoryQueue>,
    pub thaw_queue: Arc<InMemoryQueue>,
}

impl LocalPipeline {
    pub fn new(
        config: PipelineConfig,
        clock: Arc<dyn Clock>,
        objects: Arc<dyn ObjectStore>,
        vault: Arc<dyn ColdStorage>,
    ) -> Self {
        let queue = |name: &str| InMemoryQueue::arc(name, clock.clone(), config.default_lease);
        let topic = |name: &str, queue: &Arc<InMemoryQueue>| {
            let topic = Arc::new(InMemoryTopic::new(name));
            topic.subscribe(queue.clone());
            topic
        };

        let request_queue = queue("requests");
        let archive_queue = queue("archive");
        let restore_queue = queue("restore");
        let thaw_queue = queue("thaw");

        Self {
            job_requests: topic("job-requests", &request_queue),
            job_results: topic("job-results", &archive_queue),
            upgrades: topic("upgrades", &restore_queue),
            retrievals: topic("retrievals", &thaw_queue),
            request_queue,
            archive_queue,
            restore_queue,
            thaw_queue,
            records: InMemoryJobRecordStore::arc(),
            profiles: InMemoryProfileDirectory::arc(),
            objects,
            vault,
            clock,
            config,
        }
    }

    pub fn intake(&self) -> Intake {
        Intake::new(
            self.records.clone(),
            self.objects.clone(),
            self.profiles.clone(),
            self.job_requests.clone(),
            self.upgrades.clone(),
            self.clock.clone(),
            self.config.grace_policy(),
            self.config.key_prefix.clone(),
        )
    }

    pub fn runner(&self, annotator: Arc<dyn Annotator>) -> Runner {
        Runner::new(
            self.records.clone(),
            self.objects.clone(),
            self.job_results.clone(),
            annotator,
            self.clock.clone(),
            self.config.key_prefix.clone(),
        )
    }

    pub fn dispatcher(&self, launcher: Arc<dyn TaskLauncher<AnnotationTask>>) -> Dispatcher {
        Dispatcher::new(
            self.records.clone(),
            self.objects.clone(),
            self.request_queue.clone(),
            launcher,
            self.config.work_dir.clone(),
        )
    }

    pub fn archive_worker(&self) -> ArchiveWorker {
        ArchiveWorker::new(
            self.records.clone(),
            self.objects.clone(),
            self.vault.clone(),
            self.profiles.clone(),
            self.archive_queue.clone(),
            self.clock.clone(),
            self.config.grace_policy(),
        )
    }

    pub fn restore_initiator(&self) -> RestoreInitiator {
        RestoreInitiator::new(
            self.records.clone(),
            self.vault.clone(),
            self.restore_queue.clone(),
            self.retrievals.clone(),
        )
    }

    pub fn thaw_worker(&self) -> ThawWorker {
        ThawWorker::new(
            self.records.clone(),
            self.objects.clone(),
            self.vault.clone(),
            self.thaw_queue.clone(),
            self.config.thaw_backoff,
        )
    }
}
