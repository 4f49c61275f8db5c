//! Fire-and-forget task submission.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

/// Hands a task to an execution backend without waiting for it.
pub trait TaskLauncher<T>: Send + Sync {
    fn launch(&self, task: T) -> Result<(), LaunchError>;
}

impl<T, L> TaskLauncher<T> for Arc<L>
where
    L: TaskLauncher<T> + ?Sized,
{
    fn launch(&self, task: T) -> Result<(), LaunchError> {
        (**self).launch(task)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LaunchError {
    #[error("failed to spawn task thread: {0}")]
    Spawn(String),

    #[error("launcher rejected task: {0}")]
    Rejected(String),
}

impl From<io::Error> for LaunchError {
    fn from(err: io::Error) -> Self {
        LaunchError::Spawn(err.to_string())
    }
}

/// Runs each task on its own detached OS thread.
pub struct ThreadLauncher<F> {
    name: &'static str,
    run: Arc<F>,
}

impl<F> core::fmt::Debug for ThreadLauncher<F> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ThreadLauncher").field("name", &self.name).finish()
    }
}

impl<F> ThreadLauncher<F> {
    pub fn new(name: &'static str, run: F) -> Self {
        Self {
            name,
            run: Arc::new(run),
        }
    }
}

impl<T, F> TaskLauncher<T> for ThreadLauncher<F>
where
    T: Send + 'static,
    F: Fn(T) + Send + Sync + 'static,
{
    fn launch(&self, task: T) -> Result<(), LaunchError> {
        let run = self.run.clone();
        // Dropping the join handle detaches the thread.
        thread::Builder::new()
            .name(self.name.to_string())
            .spawn(move || run(task))?;
        Ok(())
    }
}

/// Records launched tasks instead of running them (tests/dev).
#[derive(Debug)]
pub struct RecordingLauncher<T> {
    launched: Mutex<Vec<T>>,
    reject: AtomicBool,
}

impl<T> Default for RecordingLauncher<T> {
    fn default() -> Self {
        Self {
            launched: Mutex::new(Vec::new()),
            reject: AtomicBool::new(false),
        }
    }
}

impl<T: Clone> RecordingLauncher<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Make subsequent launches fail with `Rejected`.
    pub fn set_rejecting(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }

    pub fn launched(&self) -> Vec<T> {
        self.launched.lock().map(|l| l.clone()).unwrap_or_default()
    }

    /// Remove and return everything launched so far.
    pub fn drain(&self) -> Vec<T> {
        self.launched
            .lock()
            .map(|mut l| std::mem::take(&mut *l))
            .unwrap_or_default()
    }
}

impl<T: Send> TaskLauncher<T> for RecordingLauncher<T> {
    fn launch(&self, task: T) -> Result<(), LaunchError> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(LaunchError::Rejected("launcher is rejecting tasks".to_string()));
        }
        let mut launched = self
            .launched
            .lock()
            .map_err(|_| LaunchError::Rejected("launcher lock poisoned".to_string()))?;
        launched.push(task);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn thread_launcher_runs_task_detached() {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let launcher = ThreadLauncher::new("test-task", move |n: u32| {
            let _ = tx.lock().unwrap().send(n * 2);
        });

        launcher.launch(21).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 42);
    }

    #[test]
    fn recording_launcher_can_reject() {
        let launcher = RecordingLauncher::<u32>::new();
        launcher.launch(1).unwrap();
        launcher.set_rejecting(true);
        assert!(matches!(launcher.launch(2), Err(LaunchError::Rejected(_))));
        assert_eq!(launcher.drain(), vec![1]);
        assert!(launcher.launched().is_empty());
    }
}
