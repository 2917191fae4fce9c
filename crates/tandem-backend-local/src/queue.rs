//! Device command queue: a pool of named worker threads draining a FIFO of jobs.

use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use tandem::backend::device::Deadline;
use tandem::backend::spec::{BackendError, BackendResult};
use tracing::{debug, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct CommandQueue {
    name: String,
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl CommandQueue {
    /// Spawns `workers` threads (at least one) named `{name}-{index}`.
    ///
    /// With a single worker, jobs run strictly in submission order.
    pub fn new(name: &str, workers: usize) -> BackendResult<Self> {
        let (tx, rx) = unbounded::<Job>();
        let mut handles = Vec::with_capacity(workers.max(1));
        for index in 0..workers.max(1) {
            let rx: Receiver<Job> = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("{name}-{index}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                })
                .map_err(|err| {
                    BackendError::execution(format!("failed to spawn {name} worker: {err}"))
                })?;
            handles.push(handle);
        }
        debug!(queue = name, workers = handles.len(), "started command queue");
        Ok(Self {
            name: name.to_string(),
            sender: Some(tx),
            workers: handles,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Enqueues `job` and returns the channel its result arrives on.
    pub fn submit<R, F>(&self, job: F) -> BackendResult<Receiver<R>>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| BackendError::execution(format!("{} queue is shut down", self.name)))?;
        let (reply_tx, reply_rx) = bounded(1);
        sender
            .send(Box::new(move || {
                // The waiter may have timed out and dropped its receiver.
                let _ = reply_tx.send(job());
            }))
            .map_err(|_| BackendError::execution(format!("{} queue is shut down", self.name)))?;
        Ok(reply_rx)
    }

    /// Enqueues `job` and blocks until it has run.
    pub fn run<R, F>(&self, job: F) -> BackendResult<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        self.run_until(job, Deadline::never())
    }

    /// Enqueues `job` and waits for it until `deadline`.
    pub fn run_until<R, F>(&self, job: F, deadline: Deadline) -> BackendResult<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        let reply = self.submit(job)?;
        let lost = || BackendError::execution(format!("{} worker exited before replying", self.name));
        match deadline.remaining() {
            None => reply.recv().map_err(|_| lost()),
            Some(remaining) => match reply.recv_timeout(remaining) {
                Ok(value) => Ok(value),
                Err(RecvTimeoutError::Timeout) => Err(deadline.timeout_error()),
                Err(RecvTimeoutError::Disconnected) => Err(lost()),
            },
        }
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!(queue = %self.name, "worker panicked");
            }
        }
        debug!(queue = %self.name, "stopped command queue");
    }
}
