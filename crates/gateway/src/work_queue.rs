use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use crate::metrics;

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueClosed;

impl std::fmt::Display for QueueClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "work queue is shut down")
    }
}

impl std::error::Error for QueueClosed {}

/// Fixed pool of workers draining one unbounded FIFO queue.
///
/// Submission never blocks; jobs wait in the queue while every worker is
/// busy. The depth (queued plus running) is exported as a gauge.
pub struct WorkQueue {
    sender: std::sync::Mutex<Option<mpsc::UnboundedSender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    depth: Arc<AtomicUsize>,
}

impl WorkQueue {
    pub fn new(workers: usize) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let depth = Arc::new(AtomicUsize::new(0));

        let handles = (0..workers.max(1))
            .map(|worker_id| {
                let receiver = receiver.clone();
                let depth = depth.clone();
                tokio::spawn(async move {
                    loop {
                        let job = receiver.lock().await.recv().await;
                        let Some(job) = job else {
                            break;
                        };
                        // Each job runs as its own task so a panic costs the job, not the worker.
                        if let Err(err) = tokio::spawn(job).await {
                            tracing::error!(worker_id, error = %err, "work queue job panicked");
                        }
                        let remaining = depth.fetch_sub(1, Ordering::SeqCst) - 1;
                        metrics::set_work_queue_depth(remaining);
                    }
                    tracing::debug!(worker_id, "work queue worker stopped");
                })
            })
            .collect();

        Self {
            sender: std::sync::Mutex::new(Some(sender)),
            workers: Mutex::new(handles),
            depth,
        }
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn submit<F>(&self, job: F) -> Result<(), QueueClosed>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let guard = match self.sender.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let Some(sender) = guard.as_ref() else {
            return Err(QueueClosed);
        };

        let queued = self.depth.fetch_add(1, Ordering::SeqCst) + 1;
        if sender.send(Box::pin(job)).is_err() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            return Err(QueueClosed);
        }
        metrics::set_work_queue_depth(queued);
        Ok(())
    }

    /// Refuses new jobs, lets queued ones finish, then joins the workers.
    pub async fn shutdown(&self) {
        let sender = match self.sender.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(sender);

        let handles = std::mem::take(&mut *self.workers.lock().await);
        for handle in handles {
            if let Err(err) = handle.await {
                tracing::error!(error = %err, "work queue worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn queued_jobs_all_run_before_shutdown_returns() {
        let queue = WorkQueue::new(2);
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let done = done.clone();
            queue
                .submit(async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    done.fetch_add(1, Ordering::SeqCst);
                })
                .expect("queue accepts work");
        }

        queue.shutdown().await;
        assert_eq!(done.load(Ordering::SeqCst), 10);
        assert_eq!(queue.depth(), 0);
    }

    #[tokio::test]
    async fn pool_size_bounds_concurrency() {
        let queue = WorkQueue::new(3);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..12 {
            let running = running.clone();
            let peak = peak.clone();
            queue
                .submit(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                })
                .unwrap();
        }

        assert!(queue.depth() > 3);
        queue.shutdown().await;
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn panicking_job_keeps_worker_alive_and_depth_accurate() {
        let queue = WorkQueue::new(1);
        let done = Arc::new(AtomicUsize::new(0));

        queue
            .submit(async { panic!("job failed") })
            .expect("queue accepts work");
        let after = done.clone();
        queue
            .submit(async move {
                after.fetch_add(1, Ordering::SeqCst);
            })
            .expect("queue accepts work");

        queue.shutdown().await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert_eq!(queue.depth(), 0);
    }

    #[tokio::test]
    async fn submit_after_shutdown_is_refused() {
        let queue = WorkQueue::new(1);
        queue.shutdown().await;
        assert_eq!(queue.submit(async {}), Err(QueueClosed));
    }
}
