//! Long-lived named thread for runtimes with thread affinity
//!
//! Some embedded runtimes must see initialize and shutdown on the same OS
//! thread. Jobs run in submission order; a job that hangs blocks the ones
//! queued behind it.

use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, error};

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AffinityError {
    #[error("Failed to spawn affinity thread: {0}")]
    Spawn(String),

    #[error("Affinity thread is gone")]
    Disconnected,

    #[error("Job panicked: {0}")]
    Panicked(String),
}

pub struct AffinityExecutor {
    name: String,
    sender: Mutex<Option<mpsc::Sender<Job>>>,
}

impl AffinityExecutor {
    /// Thread is started lazily on the first job
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sender: Mutex::new(None),
        }
    }

    fn sender(&self) -> Result<mpsc::Sender<Job>, AffinityError> {
        let mut guard = self.sender.lock();
        if let Some(sender) = guard.as_ref() {
            return Ok(sender.clone());
        }

        let (tx, rx) = mpsc::channel::<Job>();
        std::thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    job();
                }
                debug!("Affinity thread exiting");
            })
            .map_err(|e| AffinityError::Spawn(e.to_string()))?;
        debug!("Started affinity thread {}", self.name);
        *guard = Some(tx.clone());
        Ok(tx)
    }

    /// Queue a job and await its result
    pub async fn run<T, F>(&self, f: F) -> Result<T, AffinityError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            let result = catch_unwind(AssertUnwindSafe(f)).map_err(|panic| {
                let message = panic_message(panic.as_ref());
                error!("Affinity job panicked: {}", message);
                AffinityError::Panicked(message)
            });
            let _ = result_tx.send(result);
        });

        let sender = self.sender()?;
        if sender.send(job).is_err() {
            // Thread died; forget it so the next call starts a fresh one
            *self.sender.lock() = None;
            return Err(AffinityError::Disconnected);
        }
        result_rx.await.map_err(|_| AffinityError::Disconnected)?
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
