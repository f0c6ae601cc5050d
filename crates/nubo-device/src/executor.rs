use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};

use tracing::{debug, error, warn};

use crate::error::{Error, ErrorKind, Result};

const WORKER_NAME: &str = "nubo-executor";

/// A unit of work run by the [`CommandExecutor`].
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// What happens to the queued tasks when a [`CommandExecutor`] stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StopPolicy {
    /// Run every queued task before stopping.
    #[default]
    Drain,
    /// Discard the queued tasks.
    Discard,
}

enum Job {
    Run(Task),
    Stop,
}

struct Inner {
    sender: flume::Sender<Job>,
    stopped: AtomicBool,
    discard: Arc<AtomicBool>,
    policy: StopPolicy,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

impl Inner {
    fn stop(&self) {
        if self.policy == StopPolicy::Discard {
            self.discard.store(true, Ordering::Release);
        }

        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        // The worker is already gone when the channel is disconnected.
        let _ = self.sender.send(Job::Stop);

        // A task stopping the executor cannot wait for itself.
        if thread::current().id() == self.worker_id {
            return;
        }

        let worker = match self.worker.lock() {
            Ok(mut worker) => worker.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        if let Some(worker) = worker
            && worker.join().is_err()
        {
            error!("The executor worker terminated abnormally");
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A single-worker executor running tasks strictly in submission order.
///
/// Every task runs to completion before the next one starts, so tasks never
/// run concurrently. A task may submit further tasks, which run after all
/// the tasks already queued.
///
/// A panicking task is logged and the worker continues with the next one.
///
/// The executor is a cheap handle: clones share the same worker.
#[derive(Clone)]
pub struct CommandExecutor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for CommandExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandExecutor")
            .field("policy", &self.inner.policy)
            .field("stopped", &self.inner.stopped.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl CommandExecutor {
    /// Creates a [`CommandExecutor`] draining its queue on stop.
    ///
    /// # Errors
    ///
    /// Fails when the worker thread cannot be spawned.
    pub fn new() -> Result<Self> {
        Self::with_policy(StopPolicy::Drain)
    }

    /// Creates a [`CommandExecutor`] with the given [`StopPolicy`].
    ///
    /// # Errors
    ///
    /// Fails when the worker thread cannot be spawned.
    pub fn with_policy(policy: StopPolicy) -> Result<Self> {
        let (sender, receiver) = flume::unbounded();
        let discard = Arc::new(AtomicBool::new(false));

        let worker = thread::Builder::new()
            .name(WORKER_NAME.into())
            .spawn({
                let discard = Arc::clone(&discard);
                move || run_worker(&receiver, &discard)
            })
            .map_err(|e| {
                Error::new(
                    ErrorKind::Executor,
                    format!("Impossible to spawn the executor worker: {e}"),
                )
            })?;

        let worker_id = worker.thread().id();

        Ok(Self {
            inner: Arc::new(Inner {
                sender,
                stopped: AtomicBool::new(false),
                discard,
                policy,
                worker: Mutex::new(Some(worker)),
                worker_id,
            }),
        })
    }

    /// Enqueues a task.
    ///
    /// Returns `false` when the executor has been stopped and the task
    /// has been rejected.
    pub fn submit<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.inner.stopped.load(Ordering::Acquire) {
            warn!("Executor stopped, task rejected");
            return false;
        }

        if self.inner.sender.send(Job::Run(Box::new(task))).is_err() {
            warn!("Executor worker gone, task rejected");
            return false;
        }

        true
    }

    /// Stops the executor and waits for its worker.
    ///
    /// Queued tasks are run or discarded according to the [`StopPolicy`].
    /// Stopping twice has no effect.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Checks whether the executor has been stopped.
    #[must_use]
    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }
}

fn run_worker(receiver: &flume::Receiver<Job>, discard: &AtomicBool) {
    while let Ok(job) = receiver.recv() {
        let task = match job {
            Job::Run(task) => task,
            Job::Stop => break,
        };

        if discard.load(Ordering::Acquire) {
            continue;
        }

        if catch_unwind(AssertUnwindSafe(task)).is_err() {
            error!("Executor task panicked, continuing with the next one");
        }
    }

    debug!("Executor worker stopped");
}
