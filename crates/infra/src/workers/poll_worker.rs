use std::io;
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tracing::{debug, error, warn};

use annotator_events::{ChannelError, Delivery, MessageChannel};

/// What the poll loop does with a message whose processing failed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Leave the message; it is redelivered once its lease lapses.
    Redeliver,
    /// Delete the message; retrying cannot help.
    Discard,
}

/// Error type of a [`MessageProcessor`].
pub trait ProcessingError: std::error::Error {
    fn disposition(&self) -> Disposition;
}

/// One pipeline component: decodes, handles and acknowledges its own messages.
///
/// `process` owns acknowledgement on success (delete or lease extension);
/// on failure the poll loop applies the error's [`Disposition`].
pub trait MessageProcessor: Send + 'static {
    type Message: DeserializeOwned + core::fmt::Debug;
    type Outcome: core::fmt::Debug;
    type Error: ProcessingError;

    fn name(&self) -> &'static str;

    fn channel(&self) -> &dyn MessageChannel;

    fn process(&self, delivery: &Delivery<Self::Message>) -> Result<Self::Outcome, Self::Error>;
}

/// Result of a single poll.
#[derive(Debug)]
pub enum PollOutcome<O, E> {
    /// Nothing arrived within the wait.
    Idle,
    Processed(O),
    Failed { error: E, disposition: Disposition },
    /// Undecodable message; logged and deleted.
    Poison,
}

/// Receive at most one message and drive it through `processor`.
pub fn poll_once<P: MessageProcessor>(
    processor: &P,
    wait: Duration,
) -> Result<PollOutcome<P::Outcome, P::Error>, ChannelError> {
    let channel = processor.channel();
    let Some(raw) = channel.receive(wait)? else {
        return Ok(PollOutcome::Idle);
    };

    let delivery = match raw.decode::<P::Message>() {
        Ok(d) => d,
        Err(err) => {
            error!(worker = processor.name(), error = %err, body = %raw.body, "discarding undecodable message");
            discard(processor, &raw.handle);
            return Ok(PollOutcome::Poison);
        }
    };

    match processor.process(&delivery) {
        Ok(outcome) => {
            debug!(worker = processor.name(), ?outcome, "message processed");
            Ok(PollOutcome::Processed(outcome))
        }
        Err(error) => {
            let disposition = error.disposition();
            match disposition {
                Disposition::Redeliver => {
                    warn!(
                        worker = processor.name(),
                        error = %error,
                        receive_count = delivery.receive_count,
                        "processing failed; leaving message for redelivery"
                    );
                }
                Disposition::Discard => {
                    warn!(worker = processor.name(), error = %error, "processing failed; discarding message");
                    discard(processor, &delivery.handle);
                }
            }
            Ok(PollOutcome::Failed { error, disposition })
        }
    }
}

fn discard<P: MessageProcessor>(processor: &P, handle: &annotator_events::ReceiptHandle) {
    if let Err(err) = processor.channel().delete(handle) {
        warn!(worker = processor.name(), error = %err, "failed to delete message");
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStats {
    pub polls: u64,
    pub processed: u64,
    pub failed: u64,
    pub poisoned: u64,
    pub receive_errors: u64,
}

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    name: &'static str,
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Request graceful shutdown and wait for the worker to stop.
    ///
    /// The loop notices the request between polls, so this can take up to
    /// one poll wait.
    pub fn shutdown(mut self) -> WorkerStats {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            if j.join().is_err() {
                error!(worker = self.name, "worker thread panicked");
            }
        }
        self.stats()
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

/// Generic poll-loop worker.
///
/// - Long-polls the processor's channel, one message at a time
/// - Applies failure dispositions, never panics on a message failure
/// - Supports graceful shutdown
#[derive(Debug)]
pub struct PollWorker;

impl PollWorker {
    /// Spawn a worker thread named after the processor.
    pub fn spawn<P: MessageProcessor>(processor: P, wait: Duration) -> io::Result<WorkerHandle> {
        let name = processor.name();
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(WorkerStats::default()));
        let stats_clone = stats.clone();

        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || worker_loop(processor, wait, shutdown_rx, stats_clone))?;

        Ok(WorkerHandle {
            name,
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }
}

fn worker_loop<P: MessageProcessor>(
    processor: P,
    wait: Duration,
    shutdown_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<WorkerStats>>,
) {
    // Back off after a channel failure so a dead transport doesn't spin.
    let error_backoff = wait.clamp(Duration::from_millis(10), Duration::from_secs(1));

    loop {
        match shutdown_rx.try_recv() {
            Ok(()) | Err(mpsc::TryRecvError::Disconnected) => break,
            Err(mpsc::TryRecvError::Empty) => {}
        }

        let result = poll_once(&processor, wait);

        if let Ok(mut s) = stats.lock() {
            s.polls += 1;
            match &result {
                Ok(PollOutcome::Idle) => {}
                Ok(PollOutcome::Processed(_)) => s.processed += 1,
                Ok(PollOutcome::Failed { .. }) => s.failed += 1,
                Ok(PollOutcome::Poison) => s.poisoned += 1,
                Err(_) => s.receive_errors += 1,
            }
        }

        if let Err(err) = result {
            warn!(worker = processor.name(), error = %err, "receive failed");
            thread::sleep(error_backoff);
        }
    }

    debug!(worker = processor.name(), "worker stopped");
}
