//! Durable worker thread.
//!
//! WLM ties a connection to the dispatchable unit that made it and tears it
//! down when that unit ends. Connecting from a request thread would lose the
//! connection as soon as the thread exits, so the connect runs on a worker
//! thread that lives as long as the services that own it.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{EnclaveError, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A single named thread that runs submitted jobs in order.
#[derive(Debug)]
pub struct DurableWorker {
    name: String,
    jobs: Option<Sender<Job>>,
    done: Receiver<()>,
    handle: Option<JoinHandle<()>>,
}

impl DurableWorker {
    /// Start the worker thread.
    pub fn spawn(name: &str) -> Result<Self> {
        let (jobs, inbox) = mpsc::channel::<Job>();
        let (finished, done) = mpsc::channel();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                for job in inbox {
                    job();
                }
                let _ = finished.send(());
            })
            .map_err(|e| EnclaveError::WorkerUnavailable {
                reason: format!("{name}: {e}"),
            })?;
        debug!(worker = %name, "Worker started");
        Ok(Self {
            name: name.to_string(),
            jobs: Some(jobs),
            done,
            handle: Some(handle),
        })
    }

    /// Worker thread name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run a job on the worker and block until it returns. There is no
    /// timeout: the caller needs the job's answer to make progress.
    pub fn run<T, F>(&self, job: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let unavailable = |reason: &str| EnclaveError::WorkerUnavailable {
            reason: format!("{}: {reason}", self.name),
        };
        let jobs = self.jobs.as_ref().ok_or_else(|| unavailable("shut down"))?;
        let (reply, answer) = mpsc::sync_channel(1);
        jobs.send(Box::new(move || {
            let _ = reply.send(job());
        }))
        .map_err(|_| unavailable("thread ended"))?;
        answer.recv().map_err(|_| unavailable("job did not complete"))
    }

    /// Stop accepting jobs and wait for the thread to finish.
    ///
    /// With a timeout, gives up after that long and leaves the thread
    /// detached; returns whether the thread finished.
    pub fn shutdown(mut self, timeout: Option<Duration>) -> bool {
        self.jobs.take();
        let finished = match timeout {
            Some(limit) => match self.done.recv_timeout(limit) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
                Err(RecvTimeoutError::Timeout) => false,
            },
            None => {
                let _ = self.done.recv();
                true
            }
        };
        if finished {
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }
            debug!(worker = %self.name, "Worker stopped");
        } else {
            warn!(worker = %self.name, ?timeout, "Worker did not stop in time, detaching");
            self.handle.take();
        }
        finished
    }
}
