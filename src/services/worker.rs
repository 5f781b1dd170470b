use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::models::job::Job;
use crate::services::cache::{CacheError, CacheLookup, ImageCache};
use crate::services::completion::{BusError, CompletionBus};
use crate::services::queue::{JobQueue, QueueError};
use crate::services::resize::{ResizeTransform, TransformError};

/// What happened to the job a worker tried to take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// The queue had nothing pending.
    Empty,
    /// The variant is cached and its completion was published.
    Completed,
    /// Processing failed and the job went back on the retry lane.
    Requeued,
    /// Processing failed and re-enqueueing failed too; the job is lost.
    Dropped,
}

/// Takes jobs off the queue, resizes, stores and announces them.
pub struct ResizeWorker {
    queue: Arc<dyn JobQueue>,
    cache: Arc<dyn ImageCache>,
    bus: Arc<dyn CompletionBus>,
    transform: Arc<dyn ResizeTransform>,
    idle_backoff: Duration,
}

impl ResizeWorker {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        cache: Arc<dyn ImageCache>,
        bus: Arc<dyn CompletionBus>,
        transform: Arc<dyn ResizeTransform>,
        idle_backoff: Duration,
    ) -> Self {
        Self {
            queue,
            cache,
            bus,
            transform,
            idle_backoff,
        }
    }

    /// Poll the queue until `cancel` fires. A job already taken is always
    /// finished or re-enqueued before the loop exits.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                break;
            }

            let pause = match self.process_next_job().await {
                Ok(JobOutcome::Completed) => {
                    tracing::debug!("Job processed, checking for next job");
                    false
                }
                Ok(JobOutcome::Empty) => {
                    tracing::trace!("No jobs available, sleeping");
                    true
                }
                Ok(JobOutcome::Requeued | JobOutcome::Dropped) => true,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to dequeue a job");
                    true
                }
            };

            if pause {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.idle_backoff) => {}
                }
            }
        }
        tracing::info!("Worker stopped");
    }

    /// Process the next job from the queue.
    pub async fn process_next_job(&self) -> Result<JobOutcome, QueueError> {
        let job = match self.queue.dequeue().await? {
            Some(job) => job,
            None => return Ok(JobOutcome::Empty),
        };
        let key = job.name();

        tracing::info!(key = %key, width = job.width, height = job.height, "Processing resize job");

        match self.process_job(&job).await {
            Ok(()) => {
                tracing::info!(key = %key, "Job completed");
                Ok(JobOutcome::Completed)
            }
            Err(e) => {
                tracing::error!(key = %key, error = %e, "Job processing failed");
                match self.queue.enqueue_retry(&job).await {
                    Ok(()) => {
                        metrics::counter!("imgresizer_jobs_retried").increment(1);
                        tracing::info!(key = %key, "Job re-queued for retry");
                        Ok(JobOutcome::Requeued)
                    }
                    Err(e) => {
                        tracing::error!(key = %key, error = %e, "Failed to re-enqueue job, job lost");
                        Ok(JobOutcome::Dropped)
                    }
                }
            }
        }
    }

    async fn process_job(&self, job: &Job) -> Result<(), WorkerError> {
        let key = job.name();

        match self.cache.has(job).await? {
            // Another job for the same key got there first; cached entries
            // are never rewritten.
            CacheLookup::Hit => {
                tracing::debug!(key = %key, "Variant already cached");
            }
            CacheLookup::OriginalMissing => {
                return Err(WorkerError::OriginalMissing(job.original.clone()));
            }
            CacheLookup::Miss => {
                let original = match self.cache.load(&Job::original(job.original.clone())).await {
                    Ok(bytes) => bytes,
                    Err(CacheError::NotFound(_)) => {
                        return Err(WorkerError::OriginalMissing(job.original.clone()));
                    }
                    Err(e) => return Err(e.into()),
                };

                let transform = self.transform.clone();
                let (width, height) = (job.width, job.height);
                let start = std::time::Instant::now();
                let resized =
                    tokio::task::spawn_blocking(move || transform.resize(&original, width, height))
                        .await??;

                if resized.is_empty() {
                    return Err(WorkerError::EmptyOutput);
                }

                tracing::debug!(
                    key = %key,
                    bytes = resized.len(),
                    resize_ms = start.elapsed().as_millis() as u64,
                    "Resize complete"
                );
                self.cache.save(job, &resized).await?;
            }
        }

        self.bus.publish(&key).await?;
        Ok(())
    }
}

/// A set of worker tasks sharing one cancellation token.
pub struct WorkerPool {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(count: usize, worker: Arc<ResizeWorker>) -> Self {
        let cancel = CancellationToken::new();
        let handles = (0..count)
            .map(|id| {
                let worker = worker.clone();
                let cancel = cancel.clone();
                tokio::spawn(
                    async move { worker.run(cancel).await }
                        .instrument(tracing::info_span!("worker", id)),
                )
            })
            .collect();

        tracing::info!(workers = count, "Resize workers started");
        Self { cancel, handles }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Token that stops every worker in the pool.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop all workers and wait for in-flight jobs to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Worker task failed");
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Original image not found: {0}")]
    OriginalMissing(String),

    #[error("Resize produced no output")]
    EmptyOutput,

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Transform error: {0}")]
    Transform(#[from] TransformError),

    #[error("Completion bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Resize task panicked: {0}")]
    Join(#[from] tokio::task::JoinError),
}
