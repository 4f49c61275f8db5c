//! Front-end side of the pipeline: job submission, upgrades and result
//! access checks.

use std::sync::Arc;

use chrono::SubsecRound;
use tracing::info;

use annotator_core::{
    Clock, DomainError, GracePolicy, JobId, JobRecord, ObjectKey, ResultAccess, UserId, UserIdentity,
    SubscriptionTier,
};
use annotator_events::{ChannelError, EventPublisher, JobRequest, UpgradeEvent};
use annotator_infra::{JobRecordStore, ObjectStore, ProfileDirectory, ProfileError, RecordStoreError, StorageError};

#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error("invalid input: {0}")]
    Invalid(#[from] DomainError),

    #[error("no job record for {0}")]
    NotFound(JobId),

    #[error("input upload failed: {0}")]
    Storage(#[from] StorageError),

    #[error("record store error: {0}")]
    Records(#[from] RecordStoreError),

    #[error("profile directory error: {0}")]
    Profile(#[from] ProfileError),

    #[error("publish failed: {0}")]
    Publish(#[from] ChannelError),
}

pub struct Intake {
    records: Arc<dyn JobRecordStore>,
    inputs: Arc<dyn ObjectStore>,
    profiles: Arc<dyn ProfileDirectory>,
    requests: Arc<dyn EventPublisher<JobRequest>>,
    upgrades: Arc<dyn EventPublisher<UpgradeEvent>>,
    clock: Arc<dyn Clock>,
    policy: GracePolicy,
    key_prefix: String,
}

impl Intake {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        records: Arc<dyn JobRecordStore>,
        inputs: Arc<dyn ObjectStore>,
        profiles: Arc<dyn ProfileDirectory>,
        requests: Arc<dyn EventPublisher<JobRequest>>,
        upgrades: Arc<dyn EventPublisher<UpgradeEvent>>,
        clock: Arc<dyn Clock>,
        policy: GracePolicy,
        key_prefix: impl Into<String>,
    ) -> Self {
        Self {
            records,
            inputs,
            profiles,
            requests,
            upgrades,
            clock,
            policy,
            key_prefix: key_prefix.into(),
        }
    }

    /// Store the input, create the PENDING record and publish the request.
    pub fn submit_job(&self, user: &UserIdentity, file_name: &str, bytes: &[u8]) -> Result<JobRecord, IntakeError> {
        let job_id = JobId::new();
        let input_ref = ObjectKey::input(&self.key_prefix, &user.user_id, job_id, file_name)?;
        self.inputs.put(&input_ref, bytes)?;

        let record = JobRecord::pending(job_id, user.clone(), input_ref.clone(), self.clock.now().trunc_subsecs(0));
        self.records.put(record.clone())?;

        self.requests.publish(&JobRequest {
            job_id,
            user_id: user.user_id.clone(),
            user_name: user.user_name.clone(),
            user_email: user.user_email.clone(),
            s3_key_input_file: input_ref,
        })?;

        info!(%job_id, user_id = %user.user_id, file_name, "job submitted");
        Ok(record)
    }

    /// Move the user to premium and ask for their archived results back.
    pub fn request_upgrade(&self, user_id: &UserId) -> Result<(), IntakeError> {
        self.profiles.set_tier(user_id, SubscriptionTier::Premium)?;
        self.upgrades.publish(&UpgradeEvent {
            user_id: user_id.clone(),
        })?;
        info!(%user_id, "upgrade requested");
        Ok(())
    }

    pub fn result_access(&self, job_id: JobId) -> Result<ResultAccess, IntakeError> {
        let record = self.records.get(job_id)?.ok_or(IntakeError::NotFound(job_id))?;
        let tier = self.profiles.tier(&record.user_id)?;
        Ok(record.result_access(tier, &self.policy, self.clock.now()))
    }
}
