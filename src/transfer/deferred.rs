//! Deferred results: work that runs only when someone waits for it.
//!
//! A [`Deferred`] returned by the engines holds the handles of slice tasks that
//! are already running on the pool. Collecting them happens on the waiting
//! thread, so issuing many small transfers does not cost a thread each.
//! Dropping a `Deferred` without waiting still blocks until its slices finish;
//! the memory they target must not be released under them.

use tracing::debug;

use crate::transfer::error::TransferError;
use crate::transfer::pool::TaskHandle;

type Waiter<T> = Box<dyn FnOnce() -> Result<T, TransferError> + Send>;

enum Pending<T> {
    Ready(Result<T, TransferError>),
    Waiter(Waiter<T>),
    Done,
}

#[must_use = "a deferred transfer reports its outcome only when waited on"]
pub struct Deferred<T> {
    pending: Pending<T>,
}

impl<T: Send + 'static> Deferred<T> {
    /// Run `waiter` on the first call to [`wait`](Self::wait).
    pub fn new<F>(waiter: F) -> Self
    where
        F: FnOnce() -> Result<T, TransferError> + Send + 'static,
    {
        Self {
            pending: Pending::Waiter(Box::new(waiter)),
        }
    }

    /// Already resolved to `value`.
    pub fn ready(value: T) -> Self {
        Self {
            pending: Pending::Ready(Ok(value)),
        }
    }

    /// Wait for every task and fold their results in submission order.
    ///
    /// After the first failure the remaining tasks are still waited for but no
    /// longer folded; the first error is returned.
    pub fn join<R, F>(tasks: Vec<TaskHandle<R>>, init: T, mut fold: F) -> Self
    where
        R: Send + 'static,
        F: FnMut(T, R) -> T + Send + 'static,
    {
        if tasks.is_empty() {
            return Self::ready(init);
        }

        Self::new(move || {
            let mut acc = Some(init);
            let mut first_err = None;
            for task in tasks {
                match task.wait() {
                    Ok(value) => {
                        if let Some(current) = acc.take() {
                            acc = Some(fold(current, value));
                        }
                    }
                    Err(e) => {
                        acc = None;
                        first_err.get_or_insert(e);
                    }
                }
            }
            match (acc, first_err) {
                (_, Some(e)) => Err(e),
                (Some(value), None) => Ok(value),
                (None, None) => Err(TransferError::WorkerLost),
            }
        })
    }

    /// Block until the result is available.
    pub fn wait(mut self) -> Result<T, TransferError> {
        match std::mem::replace(&mut self.pending, Pending::Done) {
            Pending::Ready(result) => result,
            Pending::Waiter(waiter) => waiter(),
            Pending::Done => Err(TransferError::WorkerLost),
        }
    }

    /// Wait from async code without blocking the runtime's worker threads.
    pub async fn wait_async(self) -> Result<T, TransferError> {
        tokio::task::spawn_blocking(move || self.wait())
            .await
            .map_err(|_| TransferError::WorkerLost)?
    }
}

impl<T> Drop for Deferred<T> {
    fn drop(&mut self) {
        if let Pending::Waiter(waiter) = std::mem::replace(&mut self.pending, Pending::Done) {
            if let Err(e) = waiter() {
                debug!(error = %e, "Dropped deferred transfer failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use crate::transfer::pool::WorkerPool;

    #[test]
    fn test_waiter_runs_only_on_wait() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let deferred = Deferred::new(move || {
            flag.store(true, Ordering::SeqCst);
            Ok(5usize)
        });

        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(deferred.wait().unwrap(), 5);
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_empty_join_is_ready() {
        let deferred = Deferred::join(Vec::<TaskHandle<usize>>::new(), 0usize, |a, b| a + b);
        assert_eq!(deferred.wait().unwrap(), 0);
    }

    #[test]
    fn test_join_sums_results() {
        let pool = WorkerPool::new(4, Duration::from_millis(1)).unwrap();
        let tasks = (1..=10usize).map(|i| pool.submit(move || Ok(i))).collect();
        let total = Deferred::join(tasks, 0usize, |a, b| a + b).wait().unwrap();
        assert_eq!(total, 55);
    }

    #[test]
    fn test_join_reports_first_error_after_draining() {
        let pool = WorkerPool::new(2, Duration::from_millis(1)).unwrap();
        let finished = Arc::new(AtomicBool::new(false));

        let mut tasks = vec![
            pool.submit(|| Ok(1usize)),
            pool.submit(|| {
                Err(TransferError::SizeOutOfRange {
                    size: 2,
                    available: 1,
                })
            }),
        ];
        let flag = finished.clone();
        tasks.push(pool.submit(move || {
            std::thread::sleep(Duration::from_millis(20));
            flag.store(true, Ordering::SeqCst);
            Ok(3usize)
        }));

        let err = Deferred::join(tasks, 0usize, |a, b| a + b).wait().unwrap_err();
        assert!(matches!(err, TransferError::SizeOutOfRange { .. }));
        assert!(finished.load(Ordering::SeqCst));
    }

    #[test]
    fn test_drop_waits_for_tasks() {
        let pool = WorkerPool::new(1, Duration::from_millis(1)).unwrap();
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        let task = pool.submit(move || {
            std::thread::sleep(Duration::from_millis(20));
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });

        drop(Deferred::join(vec![task], (), |_, _| ()));
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_wait_async() {
        let deferred = Deferred::new(|| Ok(42u64));
        assert_eq!(deferred.wait_async().await.unwrap(), 42);
    }
}
