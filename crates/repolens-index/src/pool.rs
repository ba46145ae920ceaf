//! Bounded worker pool for per-file indexing jobs.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::{IndexError, Result};

/// Fixed number of tokio tasks pulling jobs from a shared queue.
#[derive(Debug, Clone, Copy)]
pub struct WorkerPool {
    workers: usize,
}

impl WorkerPool {
    #[must_use]
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    /// Run `f` over every job with at most `workers` jobs in flight.
    ///
    /// Results arrive in completion order. Workers stop taking new jobs once
    /// `cancel` fires; jobs already running finish.
    ///
    /// # Errors
    ///
    /// Returns `IndexError::Cancelled` if the token fired before the queue drained,
    /// or `IndexError::Other` if a worker task panicked.
    pub async fn run<J, R, F, Fut>(
        &self,
        jobs: Vec<J>,
        cancel: &CancellationToken,
        f: F,
    ) -> Result<Vec<R>>
    where
        J: Send + 'static,
        R: Send + 'static,
        F: Fn(J) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
    {
        let total = jobs.len();
        let queue = Arc::new(Mutex::new(VecDeque::from(jobs)));
        let f = Arc::new(f);
        let (tx, mut rx) = mpsc::channel(self.workers * 2);

        let mut set = JoinSet::new();
        for worker in 0..self.workers.min(total.max(1)) {
            let queue = Arc::clone(&queue);
            let f = Arc::clone(&f);
            let tx = tx.clone();
            let cancel = cancel.clone();
            set.spawn(async move {
                let mut done = 0usize;
                loop {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let Some(job) = queue.lock().await.pop_front() else {
                        break;
                    };
                    let result = f(job).await;
                    done += 1;
                    if tx.send(result).await.is_err() {
                        break;
                    }
                }
                tracing::trace!(worker, done, "worker finished");
            });
        }
        drop(tx);

        let mut results = Vec::with_capacity(total);
        while let Some(result) = rx.recv().await {
            results.push(result);
        }
        while let Some(joined) = set.join_next().await {
            joined?;
        }

        if results.len() < total && cancel.is_cancelled() {
            return Err(IndexError::Cancelled);
        }
        Ok(results)
    }
}
