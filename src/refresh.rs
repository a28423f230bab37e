//! Background refresh pool
//!
//! A fixed set of workers draining a bounded queue of
//! stale-while-revalidate refresh tasks. Submission never blocks: when
//! the queue is full the task is dropped, which is safe because the next
//! stale read simply tries again.

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

type Task = BoxFuture<'static, ()>;

/// Bounded worker pool for asynchronous cache refreshes.
pub struct RefreshExecutor {
    tx: mpsc::Sender<Task>,
    workers: Vec<JoinHandle<()>>,
}

impl RefreshExecutor {
    /// Spawn a pool of `threads` workers with a queue of the same size.
    pub fn new(threads: usize) -> Self {
        let threads = threads.max(1);
        let (tx, rx) = mpsc::channel::<Task>(threads);
        let rx = Arc::new(Mutex::new(rx));

        let workers = (0..threads)
            .map(|_| {
                let rx = rx.clone();
                tokio::spawn(async move {
                    loop {
                        let task = rx.lock().await.recv().await;
                        match task {
                            Some(task) => task.await,
                            None => break,
                        }
                    }
                })
            })
            .collect();

        Self { tx, workers }
    }

    /// Enqueue a refresh task without blocking. Returns `false` when the
    /// queue is full and the task was dropped.
    pub fn try_submit<F>(&self, task: F) -> bool
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        match self.tx.try_send(Box::pin(task)) {
            Ok(()) => true,
            Err(_) => {
                debug!("refresh queue full, dropping task");
                false
            }
        }
    }

    /// Close the queue and wait for workers to drain outstanding tasks.
    pub async fn shutdown(self) {
        drop(self.tx);
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_tasks_run() {
        let pool = RefreshExecutor::new(2);
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..4 {
            let done = done.clone();
            assert!(pool.try_submit(async move {
                done.fetch_add(1, Ordering::SeqCst);
            }));
            // Leave room in the bounded queue between submissions.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        pool.shutdown().await;
        assert_eq!(done.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_overflow_drops_tasks() {
        let pool = RefreshExecutor::new(1);
        let started = Arc::new(AtomicUsize::new(0));

        // Occupy the single worker, then fill the one-slot queue.
        let blocker = started.clone();
        pool.try_submit(async move {
            blocker.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(200)).await;
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(pool.try_submit(async {}));

        // Queue is now full; further submissions are dropped.
        let mut dropped = 0;
        for _ in 0..5 {
            if !pool.try_submit(async {}) {
                dropped += 1;
            }
        }
        assert!(dropped >= 4, "expected overflow drops, got {dropped}");
    }

    #[tokio::test]
    async fn test_shutdown_drains_queue() {
        let pool = RefreshExecutor::new(1);
        let done = Arc::new(AtomicUsize::new(0));

        let slow = done.clone();
        pool.try_submit(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            slow.fetch_add(1, Ordering::SeqCst);
        });
        let queued = done.clone();
        pool.try_submit(async move {
            queued.fetch_add(1, Ordering::SeqCst);
        });

        pool.shutdown().await;
        assert_eq!(done.load(Ordering::SeqCst), 2);
    }
}
