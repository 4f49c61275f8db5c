//! `annotator-core`: job-record domain model for the annotation pipeline.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the job record and its status machine, object-key conventions,
//! subscription tiers and the clock abstraction the workers are driven by.

pub mod clock;
pub mod error;
pub mod id;
pub mod job;
pub mod object_key;
pub mod tier;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::{ArchiveId, JobId, RetrievalJobId, UserId};
pub use job::{Condition, JobRecord, JobStatus, JobUpdate, ResultAccess, UserIdentity};
pub use object_key::ObjectKey;
pub use tier::{GraceDecision, GracePolicy, SubscriptionTier};
