//! Payloads carried by the pipeline's channels.
//!
//! Field names are the wire names shared with the front end, so they keep the
//! storage-flavoured `s3_key_*` spelling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use annotator_core::{ArchiveId, JobId, ObjectKey, RetrievalJobId, UserId, UserIdentity};

/// Request to run an annotation job (front end → dispatcher).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub job_id: JobId,
    pub user_id: UserId,
    pub user_name: String,
    pub user_email: String,
    pub s3_key_input_file: ObjectKey,
}

impl JobRequest {
    pub fn identity(&self) -> UserIdentity {
        UserIdentity {
            user_id: self.user_id.clone(),
            user_name: self.user_name.clone(),
            user_email: self.user_email.clone(),
        }
    }
}

/// Emitted by the runner once results are uploaded and the record is COMPLETED.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionEvent {
    pub job_id: JobId,
    pub s3_key_result_file: ObjectKey,
    pub user_id: UserId,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub complete_time: DateTime<Utc>,
    pub user_email: String,
    pub user_name: String,
}

/// A user moved to the premium tier; their archived results must come back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeEvent {
    pub user_id: UserId,
}

/// A cold-storage retrieval was initiated for one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalPendingEvent {
    pub annotation_job_id: JobId,
    pub restoration_job_id: RetrievalJobId,
    pub archive_id: ArchiveId,
    pub s3_key_result_file: ObjectKey,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn completion_time_is_epoch_seconds_on_the_wire() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let event = CompletionEvent {
            job_id: JobId::new(),
            s3_key_result_file: ObjectKey::new("gas/u/x~s.annot.vcf").unwrap(),
            user_id: UserId::new("u").unwrap(),
            complete_time: at,
            user_email: "u@example.org".to_string(),
            user_name: "U".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["complete_time"], at.timestamp());
        assert_eq!(json["s3_key_result_file"], "gas/u/x~s.annot.vcf");
    }

    #[test]
    fn retrieval_event_uses_front_end_field_names() {
        let job_id = JobId::new();
        let json = format!(
            r#"{{"annotation_job_id":"{job_id}","restoration_job_id":"R1","archive_id":"A1","s3_key_result_file":"gas/u/x~r.vcf"}}"#
        );
        let event: RetrievalPendingEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event.annotation_job_id, job_id);
        assert_eq!(event.archive_id.as_str(), "A1");
    }
}
