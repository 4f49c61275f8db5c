//! Job-record store implementations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use annotator_core::{Condition, DomainError, JobId, JobRecord, JobStatus, JobUpdate, UserId};

/// Job-record store abstraction.
pub trait JobRecordStore: Send + Sync {
    /// Read one record.
    fn get(&self, job_id: JobId) -> Result<Option<JobRecord>, RecordStoreError>;

    /// Create or overwrite a record.
    fn put(&self, record: JobRecord) -> Result<(), RecordStoreError>;

    /// Apply `update` to an existing record, optionally guarded by `condition`.
    ///
    /// Returns the record as written.
    fn update(
        &self,
        job_id: JobId,
        update: &JobUpdate,
        condition: Option<Condition>,
    ) -> Result<JobRecord, RecordStoreError>;

    /// All records submitted by `user_id` (secondary index).
    fn query_by_user(&self, user_id: &UserId) -> Result<Vec<JobRecord>, RecordStoreError>;
}

impl<S> JobRecordStore for Arc<S>
where
    S: JobRecordStore + ?Sized,
{
    fn get(&self, job_id: JobId) -> Result<Option<JobRecord>, RecordStoreError> {
        (**self).get(job_id)
    }

    fn put(&self, record: JobRecord) -> Result<(), RecordStoreError> {
        (**self).put(record)
    }

    fn update(
        &self,
        job_id: JobId,
        update: &JobUpdate,
        condition: Option<Condition>,
    ) -> Result<JobRecord, RecordStoreError> {
        (**self).update(job_id, update, condition)
    }

    fn query_by_user(&self, user_id: &UserId) -> Result<Vec<JobRecord>, RecordStoreError> {
        (**self).query_by_user(user_id)
    }
}

/// Record store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordStoreError {
    #[error("job record not found: {0}")]
    NotFound(JobId),

    /// The conditional check did not hold; nothing was written.
    #[error("condition `{condition}` failed for job {job_id} (status is {actual})")]
    ConditionFailed {
        job_id: JobId,
        condition: Condition,
        actual: JobStatus,
    },

    #[error(transparent)]
    Invariant(#[from] DomainError),

    /// Network/throttling/service failure; retry later.
    #[error("storage error: {0}")]
    Storage(String),
}

impl RecordStoreError {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, RecordStoreError::Storage(_))
    }
}

/// In-memory record store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobRecordStore {
    records: RwLock<HashMap<JobId, JobRecord>>,
    unavailable: AtomicBool,
}

impl InMemoryJobRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Simulate an outage: every call fails with a transient error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<(), RecordStoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RecordStoreError::Storage("record store unavailable".to_string()));
        }
        Ok(())
    }
}

fn poisoned() -> RecordStoreError {
    RecordStoreError::Storage("record store lock poisoned".to_string())
}

impl JobRecordStore for InMemoryJobRecordStore {
    fn get(&self, job_id: JobId) -> Result<Option<JobRecord>, RecordStoreError> {
        self.check_available()?;
        let records = self.records.read().map_err(|_| poisoned())?;
        Ok(records.get(&job_id).cloned())
    }

    fn put(&self, record: JobRecord) -> Result<(), RecordStoreError> {
        self.check_available()?;
        let mut records = self.records.write().map_err(|_| poisoned())?;
        records.insert(record.job_id, record);
        Ok(())
    }

    fn update(
        &self,
        job_id: JobId,
        update: &JobUpdate,
        condition: Option<Condition>,
    ) -> Result<JobRecord, RecordStoreError> {
        self.check_available()?;
        let mut records = self.records.write().map_err(|_| poisoned())?;
        let current = records
            .get(&job_id)
            .ok_or(RecordStoreError::NotFound(job_id))?;

        if let Some(condition) = condition {
            if !condition.matches(current) {
                return Err(RecordStoreError::ConditionFailed {
                    job_id,
                    condition,
                    actual: current.status,
                });
            }
        }

        // Apply on a copy so a rejected update leaves the stored record untouched.
        let mut next = current.clone();
        next.apply(update)?;
        records.insert(job_id, next.clone());
        Ok(next)
    }

    fn query_by_user(&self, user_id: &UserId) -> Result<Vec<JobRecord>, RecordStoreError> {
        self.check_available()?;
        let records = self.records.read().map_err(|_| poisoned())?;
        let mut result: Vec<_> = records
            .values()
            .filter(|r| &r.user_id == user_id)
            .cloned()
            .collect();

        result.sort_by_key(|r| (r.submit_time, r.job_id));
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use annotator_core::{ArchiveId, ObjectKey, UserIdentity};
    use chrono::Utc;

    fn identity(user: &str) -> UserIdentity {
        UserIdentity {
            user_id: UserId::new(user).unwrap(),
            user_name: user.to_string(),
            user_email: format!("{user}@example.org"),
        }
    }

    fn pending(user: &str) -> JobRecord {
        let job_id = JobId::new();
        let ident = identity(user);
        let key = ObjectKey::input("gas", &ident.user_id, job_id, "s.vcf").unwrap();
        JobRecord::pending(job_id, ident, key, Utc::now())
    }

    #[test]
    fn put_and_get() {
        let store = InMemoryJobRecordStore::new();
        let rec = pending("u1");
        store.put(rec.clone()).unwrap();
        assert_eq!(store.get(rec.job_id).unwrap(), Some(rec));
        assert_eq!(store.get(JobId::new()).unwrap(), None);
    }

    #[test]
    fn conditional_update_is_compare_and_set() {
        let store = InMemoryJobRecordStore::new();
        let rec = pending("u1");
        store.put(rec.clone()).unwrap();

        let running = JobUpdate::new().status(JobStatus::Running);
        let cond = Some(Condition::StatusIs(JobStatus::Pending));

        let written = store.update(rec.job_id, &running, cond).unwrap();
        assert_eq!(written.status, JobStatus::Running);

        // Second delivery of the same transition fails cleanly.
        let err = store.update(rec.job_id, &running, cond).unwrap_err();
        assert_eq!(
            err,
            RecordStoreError::ConditionFailed {
                job_id: rec.job_id,
                condition: Condition::StatusIs(JobStatus::Pending),
                actual: JobStatus::Running,
            }
        );
    }

    #[test]
    fn rejected_update_leaves_record_untouched() {
        let store = InMemoryJobRecordStore::new();
        let rec = pending("u1");
        store.put(rec.clone()).unwrap();
        store
            .update(rec.job_id, &JobUpdate::new().status(JobStatus::Completed), None)
            .unwrap();

        let regress = JobUpdate::new()
            .status(JobStatus::Running)
            .archive_ref(ArchiveId::new("A1").unwrap());
        assert!(matches!(
            store.update(rec.job_id, &regress, None),
            Err(RecordStoreError::Invariant(_))
        ));

        let stored = store.get(rec.job_id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert!(!stored.is_archived());
    }

    #[test]
    fn update_of_missing_record_is_not_found() {
        let store = InMemoryJobRecordStore::new();
        let id = JobId::new();
        assert_eq!(
            store.update(id, &JobUpdate::new(), None),
            Err(RecordStoreError::NotFound(id))
        );
    }

    #[test]
    fn query_by_user_uses_user_index() {
        let store = InMemoryJobRecordStore::new();
        store.put(pending("u1")).unwrap();
        store.put(pending("u1")).unwrap();
        store.put(pending("u2")).unwrap();

        let u1 = store.query_by_user(&UserId::new("u1").unwrap()).unwrap();
        assert_eq!(u1.len(), 2);
        assert!(u1.iter().all(|r| r.user_id.as_str() == "u1"));
    }

    #[test]
    fn outage_is_transient() {
        let store = InMemoryJobRecordStore::new();
        store.set_unavailable(true);
        let err = store.get(JobId::new()).unwrap_err();
        assert!(err.is_transient());
    }
}
