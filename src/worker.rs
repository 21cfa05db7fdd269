//! Worker pool for per-connection CPU work.
//!
//! Fixed set of threads draining a channel of boxed jobs. Parsing and
//! command execution run here so the reactor thread never blocks on the
//! store mutex. Per-connection ordering is the submitter's concern: the
//! engine queues at most one job per connection at a time.

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkerPool {
    sender: Mutex<Option<Sender<Job>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn `threads` workers; zero means twice the hardware threads.
    pub fn new(threads: usize) -> Self {
        let threads = if threads == 0 {
            thread::available_parallelism().map(|n| n.get() * 2).unwrap_or(2)
        } else {
            threads
        };

        let (sender, receiver) = unbounded::<Job>();
        let mut handles = Vec::with_capacity(threads);

        for worker_id in 0..threads {
            let receiver: Receiver<Job> = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("worker-{worker_id}"))
                .spawn(move || worker_loop(worker_id, receiver))
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }

        WorkerPool {
            sender: Mutex::new(Some(sender)),
            handles: Mutex::new(handles),
        }
    }

    /// Enqueue a job. Jobs submitted after `shutdown` are dropped.
    pub fn submit(&self, job: Job) {
        let sender = self.sender.lock().unwrap();
        match sender.as_ref() {
            Some(sender) => {
                if sender.send(job).is_err() {
                    debug!("worker pool is shut down, job dropped");
                }
            }
            None => debug!("worker pool is shut down, job dropped"),
        }
    }

    /// Close the queue and join every worker. Queued jobs still run.
    pub fn shutdown(&self) {
        self.sender.lock().unwrap().take();
        let handles: Vec<_> = self.handles.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(worker_id: usize, receiver: Receiver<Job>) {
    debug!(worker = worker_id, "worker started");
    while let Ok(job) = receiver.recv() {
        // A panicking job must not take the worker thread down with it.
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!(worker = worker_id, "task panicked");
        }
    }
    debug!(worker = worker_id, "worker exited");
}
