//! Fixed-size worker pool owned by one transfer engine.
//!
//! Idle workers block on the queue for at most `idle_poll` at a time. Dropping
//! the pool closes the queue; workers finish everything already queued and are
//! joined before `drop` returns.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, warn};

use crate::transfer::error::TransferError;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Result slot of one submitted task.
pub struct TaskHandle<T> {
    rx: Receiver<Result<T, TransferError>>,
}

impl<T> TaskHandle<T> {
    /// Block until the task has run.
    pub fn wait(self) -> Result<T, TransferError> {
        self.rx.recv().map_err(|_| TransferError::WorkerLost)?
    }
}

pub struct WorkerPool {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `threads` workers (at least one).
    pub fn new(threads: usize, idle_poll: Duration) -> io::Result<Self> {
        let threads = threads.max(1);
        let (sender, receiver) = unbounded::<Job>();

        let mut workers = Vec::with_capacity(threads);
        for id in 0..threads {
            let receiver = receiver.clone();
            let worker = thread::Builder::new()
                .name(format!("gds-io-worker-{id}"))
                .spawn(move || worker_loop(receiver, idle_poll))?;
            workers.push(worker);
        }

        debug!(threads, "Started transfer worker pool");
        Ok(Self {
            sender: Some(sender),
            workers,
        })
    }

    pub fn threads(&self) -> usize {
        self.workers.len()
    }

    /// Queue `task`; its result is collected through the returned handle.
    pub fn submit<T, F>(&self, task: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, TransferError> + Send + 'static,
    {
        let (tx, rx) = bounded(1);
        let job: Job = Box::new(move || {
            // The caller may have stopped listening; the work still ran.
            let _ = tx.send(task());
        });

        if let Some(sender) = &self.sender {
            // On failure the job, and with it `tx`, is dropped and the handle
            // reports `WorkerLost`.
            let _ = sender.send(job);
        }
        TaskHandle { rx }
    }
}

fn worker_loop(receiver: Receiver<Job>, idle_poll: Duration) {
    loop {
        match receiver.recv_timeout(idle_poll) {
            Ok(job) => {
                if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                    warn!("Transfer task panicked");
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        debug!("Stopped transfer worker pool");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_tasks_run_on_named_workers() {
        let pool = WorkerPool::new(2, Duration::from_millis(1)).unwrap();
        assert_eq!(pool.threads(), 2);

        let name = pool
            .submit(|| Ok(thread::current().name().unwrap_or_default().to_string()))
            .wait()
            .unwrap();
        assert!(name.starts_with("gds-io-worker-"));
    }

    #[test]
    fn test_errors_reach_the_handle() {
        let pool = WorkerPool::new(1, Duration::from_millis(1)).unwrap();
        let err = pool
            .submit::<(), _>(|| Err(TransferError::WorkerLost))
            .wait()
            .unwrap_err();
        assert!(matches!(err, TransferError::WorkerLost));
    }

    #[test]
    fn test_panicking_task_reports_lost_worker() {
        let pool = WorkerPool::new(1, Duration::from_millis(1)).unwrap();
        let err = pool
            .submit::<(), _>(|| panic!("slice blew up"))
            .wait()
            .unwrap_err();
        assert!(matches!(err, TransferError::WorkerLost));

        // The worker survives the panic.
        assert_eq!(pool.submit(|| Ok(7)).wait().unwrap(), 7);
    }

    #[test]
    fn test_drop_drains_queued_tasks() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let pool = WorkerPool::new(2, Duration::from_millis(1)).unwrap();
            for _ in 0..50 {
                let counter = counter.clone();
                pool.submit(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                });
            }
        }
        assert_eq!(counter.load(Ordering::SeqCst), 50);
    }
}
