//! The annotation job lifecycle.
//!
//! - [`Dispatcher`] (C1) launches annotation tasks for job requests
//! - [`Runner`] (C2) annotates, uploads and marks jobs COMPLETED
//! - [`ArchiveWorker`] (C3) moves free-tier results to cold storage after the grace period
//! - [`RestoreInitiator`] (C4) starts retrievals when a user upgrades
//! - [`ThawWorker`] (C5) brings retrieved results back to hot storage
//!
//! Components talk only through channels and the job-record store. Each one
//! processes a single delivery via [`annotator_infra::MessageProcessor`] and
//! is driven by [`annotator_infra::PollWorker`].

pub mod archive;
pub mod dispatcher;
pub mod intake;
pub mod local;
pub mod restore;
pub mod runner;
pub mod thaw;

pub use archive::{ArchiveError, ArchiveOutcome, ArchiveWorker};
pub use dispatcher::{AnnotationTask, DispatchError, DispatchOutcome, Dispatcher};
pub use intake::{Intake, IntakeError};
pub use local::LocalPipeline;
pub use restore::{FailedRetrieval, InitiatedRetrieval, RestoreError, RestoreInitiator, RestoreReport};
pub use runner::{AnnotationOutput, Annotator, CommandAnnotator, CountingAnnotator, RunError, RunReport, Runner};
pub use thaw::{ThawError, ThawOutcome, ThawWorker};
