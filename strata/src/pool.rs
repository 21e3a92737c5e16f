//! A fixed pool of named worker threads fed by a shared job channel.

use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use std::io;

use crossbeam_channel::{unbounded, Sender, Receiver};
use tracing::{trace, warn};


/// A job run to completion by one worker.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Worker threads sharing a single unbounded job queue. Dropping the pool closes the
/// queue, lets workers finish every queued job and joins them.
pub struct WorkerPool {
    /// Job sender, only none while dropping.
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {

    /// Spawn a pool with the given number of workers, at least one worker is spawned.
    pub fn new(name: &str, count: usize) -> io::Result<Self> {

        let (sender, receiver) = unbounded::<Job>();
        let mut workers = Vec::with_capacity(count.max(1));

        for i in 0..count.max(1) {
            let receiver = receiver.clone();
            workers.push(thread::Builder::new()
                .name(format!("{name} Worker #{i}"))
                .spawn(move || run_worker(receiver))?);
        }

        Ok(Self {
            sender: Some(sender),
            workers,
        })

    }

    /// Number of workers in this pool.
    #[inline]
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Number of jobs waiting for a worker.
    pub fn queued(&self) -> usize {
        self.sender.as_ref().map_or(0, |sender| sender.len())
    }

    /// Submit a job to the pool, it will run on one of the workers.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) {
        if let Some(sender) = &self.sender {
            // Workers only exit once the sender is dropped, so this cannot fail.
            let _ = sender.send(Box::new(job));
        }
    }

}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        drop(self.sender.take());
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn run_worker(receiver: Receiver<Job>) {
    // Run while the channel is existing, so while the pool exists.
    while let Ok(job) = receiver.recv() {
        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            warn!("a job panicked in worker {:?}", thread::current().name());
        }
    }
    trace!("worker {:?} stopped", thread::current().name());
}
