//! The job record and its status machine.
//!
//! One record exists per submitted job. Ownership of fields is split between
//! the workers: the dispatcher owns `PENDING -> RUNNING`, the runner owns the
//! completion fields, the archive worker sets `archive_ref` and the thaw worker
//! clears it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{ArchiveId, JobId, UserId};
use crate::object_key::ObjectKey;
use crate::tier::{GracePolicy, SubscriptionTier};

/// Job lifecycle status. Ordered: a record only ever moves forward.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
}

impl JobStatus {
    /// Whether moving from `self` to `next` keeps status monotonic.
    ///
    /// Re-applying the current status is allowed (idempotent retries).
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        next >= self
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Submitter identity carried by requests and events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub user_id: UserId,
    pub user_name: String,
    pub user_email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub user_id: UserId,
    pub user_name: String,
    pub user_email: String,
    pub input_file_name: String,
    #[serde(rename = "s3_key_input_file")]
    pub input_ref: ObjectKey,
    #[serde(rename = "s3_key_result_file", default)]
    pub result_ref: Option<ObjectKey>,
    #[serde(rename = "s3_key_log_file", default)]
    pub log_ref: Option<ObjectKey>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub submit_time: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_seconds_option", default)]
    pub complete_time: Option<DateTime<Utc>>,
    #[serde(rename = "job_status")]
    pub status: JobStatus,
    #[serde(
        rename = "results_file_archive_id",
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub archive_ref: Option<ArchiveId>,
}

fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<ArchiveId>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw {
        Some(s) if !s.trim().is_empty() => ArchiveId::new(s)
            .map(Some)
            .map_err(serde::de::Error::custom),
        _ => Ok(None),
    }
}

impl JobRecord {
    /// A freshly submitted job.
    pub fn pending(
        job_id: JobId,
        user: UserIdentity,
        input_ref: ObjectKey,
        submit_time: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id,
            user_id: user.user_id,
            user_name: user.user_name,
            user_email: user.user_email,
            input_file_name: input_ref.display_name().to_string(),
            input_ref,
            result_ref: None,
            log_ref: None,
            submit_time,
            complete_time: None,
            status: JobStatus::Pending,
            archive_ref: None,
        }
    }

    pub fn identity(&self) -> UserIdentity {
        UserIdentity {
            user_id: self.user_id.clone(),
            user_name: self.user_name.clone(),
            user_email: self.user_email.clone(),
        }
    }

    /// Archived results are in cold storage and absent from hot storage.
    pub fn is_archived(&self) -> bool {
        self.archive_ref.is_some()
    }

    /// Apply a field update, enforcing record invariants.
    ///
    /// - status never regresses
    /// - `result_ref` / `log_ref` are set once (re-writing the same value is a no-op)
    pub fn apply(&mut self, update: &JobUpdate) -> DomainResult<()> {
        if let Some(next) = update.status {
            if !self.status.can_transition_to(next) {
                return Err(DomainError::invariant(format!(
                    "job {} status cannot move from {} to {}",
                    self.job_id, self.status, next
                )));
            }
        }
        check_set_once("result_ref", &self.result_ref, &update.result_ref)?;
        check_set_once("log_ref", &self.log_ref, &update.log_ref)?;

        if let Some(next) = update.status {
            self.status = next;
        }
        if let Some(key) = &update.result_ref {
            self.result_ref = Some(key.clone());
        }
        if let Some(key) = &update.log_ref {
            self.log_ref = Some(key.clone());
        }
        if let Some(at) = update.complete_time {
            self.complete_time = Some(at);
        }
        if let Some(archive_ref) = &update.archive_ref {
            self.archive_ref = archive_ref.clone();
        }
        Ok(())
    }

    /// What a viewer with `tier` may do with this job's result at `now`.
    pub fn result_access(
        &self,
        tier: SubscriptionTier,
        policy: &GracePolicy,
        now: DateTime<Utc>,
    ) -> ResultAccess {
        if self.status != JobStatus::Completed {
            return ResultAccess::NotReady;
        }
        if self.is_archived() {
            return ResultAccess::Archived;
        }
        match (tier, self.complete_time) {
            (SubscriptionTier::Free, Some(done)) if policy.has_expired(done, now) => {
                ResultAccess::Expired
            }
            _ => ResultAccess::Available,
        }
    }
}

fn check_set_once(
    field: &str,
    current: &Option<ObjectKey>,
    next: &Option<ObjectKey>,
) -> DomainResult<()> {
    match (current, next) {
        (Some(cur), Some(new)) if cur != new => Err(DomainError::invariant(format!(
            "{field} already set to {cur}, refusing {new}"
        ))),
        _ => Ok(()),
    }
}

/// Whether a job's result can be downloaded right now.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ResultAccess {
    /// The job has not completed yet.
    NotReady,
    /// The result is in hot storage and visible to this viewer.
    Available,
    /// Free-tier grace period is over; an upgrade is required.
    Expired,
    /// In cold storage; it comes back hot once the owner upgrades and the
    /// retrieval finishes.
    Archived,
}

/// Precondition for a conditional record update.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Condition {
    StatusIs(JobStatus),
}

impl Condition {
    pub fn matches(&self, record: &JobRecord) -> bool {
        match self {
            Condition::StatusIs(expected) => record.status == *expected,
        }
    }
}

impl core::fmt::Display for Condition {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Condition::StatusIs(s) => write!(f, "job_status = {s}"),
        }
    }
}

/// Partial set of record fields to write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub result_ref: Option<ObjectKey>,
    pub log_ref: Option<ObjectKey>,
    pub complete_time: Option<DateTime<Utc>>,
    /// `Some(None)` clears the archive reference.
    pub archive_ref: Option<Option<ArchiveId>>,
}

impl JobUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn result_ref(mut self, key: ObjectKey) -> Self {
        self.result_ref = Some(key);
        self
    }

    pub fn log_ref(mut self, key: ObjectKey) -> Self {
        self.log_ref = Some(key);
        self
    }

    pub fn complete_time(mut self, at: DateTime<Utc>) -> Self {
        self.complete_time = Some(at);
        self
    }

    pub fn archive_ref(mut self, archive_id: ArchiveId) -> Self {
        self.archive_ref = Some(Some(archive_id));
        self
    }

    pub fn clear_archive_ref(mut self) -> Self {
        self.archive_ref = Some(None);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}
