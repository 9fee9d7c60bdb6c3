//! Bounded background task queue.
//!
//! # Responsibilities
//! - Accept fire-and-forget jobs from the request path without blocking it
//! - Run them with bounded concurrency
//! - Count submissions, completions, failures and drops
//!
//! # Design Decisions
//! - `submit` uses `try_send`; a full queue drops the job rather than
//!   applying backpressure to clients
//! - Each job runs in its own task so a panic is contained and counted
//!   as a failure

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, Notify, Semaphore};

/// Error returned by a background job.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out")]
    Timeout,

    #[error("{0}")]
    Failed(String),
}

type Job = Pin<Box<dyn Future<Output = Result<(), TaskError>> + Send>>;

struct Envelope {
    kind: &'static str,
    job: Job,
}

/// Counters shared between the queue handle and its dispatcher.
#[derive(Debug, Default)]
pub struct TaskStats {
    pub submitted: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub dropped: AtomicU64,
    settled: Notify,
}

impl TaskStats {
    fn is_idle(&self) -> bool {
        let done = self.completed.load(Ordering::SeqCst) + self.failed.load(Ordering::SeqCst);
        done >= self.submitted.load(Ordering::SeqCst)
    }
}

/// Handle to the background queue. Cheap to clone.
#[derive(Clone)]
pub struct TaskQueue {
    tx: mpsc::Sender<Envelope>,
    stats: Arc<TaskStats>,
}

impl TaskQueue {
    /// Create the queue and spawn its dispatcher on the current runtime.
    ///
    /// The dispatcher exits once every handle has been dropped and the
    /// buffered jobs have been started.
    pub fn new(capacity: usize, concurrency: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let stats = Arc::new(TaskStats::default());
        tokio::spawn(dispatch(rx, concurrency.max(1), stats.clone()));
        Self { tx, stats }
    }

    /// Queue a job. Returns `false` when the job was dropped.
    pub fn submit<F>(&self, kind: &'static str, job: F) -> bool
    where
        F: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        // Count first so `wait_idle` never observes a queued job as settled.
        self.stats.submitted.fetch_add(1, Ordering::SeqCst);
        let envelope = Envelope {
            kind,
            job: Box::pin(job),
        };
        match self.tx.try_send(envelope) {
            Ok(()) => true,
            Err(_) => {
                self.stats.submitted.fetch_sub(1, Ordering::SeqCst);
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                crate::observability::metrics::record_task_dropped(kind);
                tracing::warn!(kind, "Background queue full, job dropped");
                self.stats.settled.notify_waiters();
                false
            }
        }
    }

    pub fn stats(&self) -> &TaskStats {
        &self.stats
    }

    /// Wait until every accepted job has finished.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.stats.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.stats.is_idle() {
                return;
            }
            notified.await;
        }
    }
}

async fn dispatch(mut rx: mpsc::Receiver<Envelope>, concurrency: usize, stats: Arc<TaskStats>) {
    let permits = Arc::new(Semaphore::new(concurrency));

    while let Some(Envelope { kind, job }) = rx.recv().await {
        let permit = match permits.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => break,
        };
        let stats = stats.clone();

        tokio::spawn(async move {
            let _permit = permit;
            match tokio::spawn(job).await {
                Ok(Ok(())) => {
                    stats.completed.fetch_add(1, Ordering::SeqCst);
                }
                Ok(Err(e)) => {
                    stats.failed.fetch_add(1, Ordering::SeqCst);
                    tracing::warn!(kind, error = %e, "Background job failed");
                }
                Err(e) => {
                    stats.failed.fetch_add(1, Ordering::SeqCst);
                    tracing::error!(kind, error = %e, "Background job panicked");
                }
            }
            stats.settled.notify_waiters();
        });
    }

    tracing::debug!("Background dispatcher stopped");
}
