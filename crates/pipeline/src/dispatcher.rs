//! Annotation dispatcher: turns job requests into running annotation tasks.
//!
//! ```text
//! JobRequest
//!   ↓
//! 1. Duplicate check (record already past PENDING → ack, launch nothing)
//!   ↓
//! 2. Materialize <work_root>/<job_id>/ and download the input into it
//!   ↓
//! 3. Launch the annotation task (fire-and-forget)
//!   ↓
//! 4. Conditional update: RUNNING if PENDING
//!   ↓
//! 5. Ack the request
//! ```
//!
//! The conditional update is the pipeline's only compare-and-set; it is what
//! makes a redelivered request harmless once the first delivery went through.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, instrument, warn};

use annotator_core::{Condition, JobId, JobStatus, JobUpdate, UserIdentity};
use annotator_events::{ChannelError, Delivery, JobRequest, MessageChannel};
use annotator_infra::{
    Disposition, JobRecordStore, LaunchError, MessageProcessor, ObjectStore, ProcessingError,
    RecordStoreError, StorageError, TaskLauncher,
};

/// Everything the runner needs to process one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotationTask {
    pub job_id: JobId,
    pub input_path: PathBuf,
    pub work_dir: PathBuf,
    pub user: UserIdentity,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Launched { job_id: JobId, input_path: PathBuf },
    /// The record had already moved on; nothing was launched.
    Duplicate { job_id: JobId, status: JobStatus },
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("no job record for {0}")]
    MissingRecord(JobId),

    /// Another delivery won the PENDING → RUNNING transition.
    #[error("job {job_id} already advanced to {actual}")]
    AlreadyAdvanced { job_id: JobId, actual: JobStatus },

    #[error("failed to prepare working area {path}: {reason}")]
    WorkingArea { path: PathBuf, reason: String },

    #[error("failed to download input: {0}")]
    Download(#[source] StorageError),

    #[error("failed to launch annotation task: {0}")]
    Launch(#[source] LaunchError),

    #[error("record store error: {0}")]
    Records(#[source] RecordStoreError),

    #[error("failed to ack job request: {0}")]
    Ack(#[source] ChannelError),
}

impl ProcessingError for DispatchError {
    fn disposition(&self) -> Disposition {
        match self {
            DispatchError::MissingRecord(_) | DispatchError::AlreadyAdvanced { .. } => Disposition::Discard,
            DispatchError::Records(e) if !e.is_transient() => Disposition::Discard,
            _ => Disposition::Redeliver,
        }
    }
}

/// C1: pulls job requests and launches annotation tasks.
pub struct Dispatcher {
    records: Arc<dyn JobRecordStore>,
    inputs: Arc<dyn ObjectStore>,
    requests: Arc<dyn MessageChannel>,
    launcher: Arc<dyn TaskLauncher<AnnotationTask>>,
    work_root: PathBuf,
}

impl Dispatcher {
    pub fn new(
        records: Arc<dyn JobRecordStore>,
        inputs: Arc<dyn ObjectStore>,
        requests: Arc<dyn MessageChannel>,
        launcher: Arc<dyn TaskLauncher<AnnotationTask>>,
        work_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            records,
            inputs,
            requests,
            launcher,
            work_root: work_root.into(),
        }
    }

    pub fn work_root(&self) -> &Path {
        &self.work_root
    }

    #[instrument(
        skip(self, delivery),
        fields(job_id = %delivery.message.job_id, receive_count = delivery.receive_count)
    )]
    pub fn process(&self, delivery: &Delivery<JobRequest>) -> Result<DispatchOutcome, DispatchError> {
        let request = &delivery.message;
        let job_id = request.job_id;

        let record = self
            .records
            .get(job_id)
            .map_err(DispatchError::Records)?
            .ok_or(DispatchError::MissingRecord(job_id))?;

        if record.status > JobStatus::Pending {
            info!(status = %record.status, "duplicate job request; already dispatched");
            self.requests.delete(&delivery.handle).map_err(DispatchError::Ack)?;
            return Ok(DispatchOutcome::Duplicate {
                job_id,
                status: record.status,
            });
        }

        let work_dir = self.work_root.join(job_id.to_string());
        fs::create_dir_all(&work_dir).map_err(|e| DispatchError::WorkingArea {
            path: work_dir.clone(),
            reason: e.to_string(),
        })?;

        let input_path = work_dir.join(request.s3_key_input_file.file_name());
        if let Err(err) = self.inputs.download_to(&request.s3_key_input_file, &input_path) {
            // The next delivery recreates it.
            if let Err(cleanup) = fs::remove_dir_all(&work_dir) {
                warn!(path = %work_dir.display(), error = %cleanup, "failed to remove working directory");
            }
            return Err(DispatchError::Download(err));
        }

        let task = AnnotationTask {
            job_id,
            input_path: input_path.clone(),
            work_dir,
            user: request.identity(),
        };
        self.launcher.launch(task).map_err(DispatchError::Launch)?;

        let running = JobUpdate::new().status(JobStatus::Running);
        match self
            .records
            .update(job_id, &running, Some(Condition::StatusIs(JobStatus::Pending)))
        {
            Ok(_) => {}
            Err(RecordStoreError::ConditionFailed { actual, .. }) => {
                warn!(%actual, "conditional RUNNING update failed");
                return Err(DispatchError::AlreadyAdvanced { job_id, actual });
            }
            Err(e) => return Err(DispatchError::Records(e)),
        }

        self.requests.delete(&delivery.handle).map_err(DispatchError::Ack)?;
        info!(input = %input_path.display(), "annotation task launched");

        Ok(DispatchOutcome::Launched { job_id, input_path })
    }
}

impl MessageProcessor for Dispatcher {
    type Message = JobRequest;
    type Outcome = DispatchOutcome;
    type Error = DispatchError;

    fn name(&self) -> &'static str {
        "annotation-dispatcher"
    }

    fn channel(&self) -> &dyn MessageChannel {
        self.requests.as_ref()
    }

    fn process(&self, delivery: &Delivery<JobRequest>) -> Result<DispatchOutcome, DispatchError> {
        Dispatcher::process(self, delivery)
    }
}
