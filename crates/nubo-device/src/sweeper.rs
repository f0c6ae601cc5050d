use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{debug, error};

use crate::error::{Error, ErrorKind, Result};

const SWEEPER_NAME: &str = "nubo-sweeper";

enum Signal {
    Wake,
    Stop,
}

/// A background thread that periodically cleans a shared table.
///
/// The table is swept on every wake up, and one last time when the sweeper
/// shuts down. The sweep runs with the table locked.
pub(crate) struct Sweeper {
    sender: flume::Sender<Signal>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Sweeper {
    pub(crate) fn spawn<T, F>(table: Arc<Mutex<T>>, sweep: F) -> Result<Self>
    where
        T: Send + 'static,
        F: Fn(&mut T) + Send + 'static,
    {
        let (sender, receiver) = flume::unbounded();

        let worker = thread::Builder::new()
            .name(SWEEPER_NAME.into())
            .spawn(move || {
                while let Ok(signal) = receiver.recv() {
                    match table.lock() {
                        Ok(mut table) => sweep(&mut *table),
                        Err(poisoned) => sweep(&mut *poisoned.into_inner()),
                    }

                    if let Signal::Stop = signal {
                        break;
                    }
                }
                debug!("Sweeper stopped");
            })
            .map_err(|e| {
                Error::new(
                    ErrorKind::Executor,
                    format!("Impossible to spawn the sweeper: {e}"),
                )
            })?;

        Ok(Self {
            sender,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub(crate) fn wake(&self) {
        if self.sender.send(Signal::Wake).is_err() {
            debug!("Sweeper already stopped");
        }
    }

    // Performs a final sweep and waits for the sweeper thread.
    pub(crate) fn shutdown(&self) {
        let worker = match self.worker.lock() {
            Ok(mut worker) => worker.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(worker) = worker else {
            return;
        };

        let _ = self.sender.send(Signal::Stop);

        // The last owner of the table may be dropped on the sweeper itself.
        if thread::current().id() == worker.thread().id() {
            return;
        }

        if worker.join().is_err() {
            error!("The sweeper terminated abnormally");
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.shutdown();
    }
}
