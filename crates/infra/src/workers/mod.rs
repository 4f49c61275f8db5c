//! Background poll-loop workers.

pub mod poll_worker;

pub use poll_worker::{
    poll_once, Disposition, MessageProcessor, PollOutcome, PollWorker, ProcessingError, WorkerHandle,
    WorkerStats,
};
