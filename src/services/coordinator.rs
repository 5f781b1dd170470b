//! Request-time cache fill: serve a cached variant, or queue its resize and
//! wait for the completion bus before serving it.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::models::job::{Job, SizeError};
use crate::services::cache::{CacheLookup, ImageCache, ServedImage};
use crate::services::completion::{BusError, CompletionBus};
use crate::services::queue::JobQueue;

/// Why an image request could not be served.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error(transparent)]
    Validation(#[from] SizeError),

    #[error("not found")]
    NotFound,

    #[error("image was not ready in time")]
    Unavailable,

    #[error("internal error")]
    Internal,
}

/// How a successful request was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchSource {
    CacheHit,
    Resized,
}

#[derive(Debug)]
pub struct Fetched {
    pub image: ServedImage,
    pub source: FetchSource,
}

pub struct Coordinator {
    queue: Arc<dyn JobQueue>,
    cache: Arc<dyn ImageCache>,
    bus: Arc<dyn CompletionBus>,
    wait_timeout: Duration,
}

impl Coordinator {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        cache: Arc<dyn ImageCache>,
        bus: Arc<dyn CompletionBus>,
        wait_timeout: Duration,
    ) -> Self {
        Self {
            queue,
            cache,
            bus,
            wait_timeout,
        }
    }

    pub fn cache(&self) -> &Arc<dyn ImageCache> {
        &self.cache
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    /// Resolve `filename` at the optional `WxH` size into a servable image.
    pub async fn fetch(&self, filename: &str, size: Option<&str>) -> Result<Fetched, FetchError> {
        let job = Job::from_request(filename, size)?;
        let key = job.name();

        let source = match self.cache.has(&job).await {
            Ok(CacheLookup::Hit) => {
                metrics::counter!("imgresizer_cache_hits").increment(1);
                FetchSource::CacheHit
            }
            Ok(CacheLookup::OriginalMissing) => return Err(FetchError::NotFound),
            Ok(CacheLookup::Miss) => {
                metrics::counter!("imgresizer_cache_misses").increment(1);
                self.fill(&job, &key).await?;
                metrics::counter!("imgresizer_resized_images").increment(1);
                FetchSource::Resized
            }
            Err(e) => {
                tracing::error!(key = %key, error = %e, "Failed to check image existence");
                return Err(FetchError::Internal);
            }
        };

        // The entry can still vanish between the lookup and here.
        match self.cache.serve(&job).await {
            Ok(image) => Ok(Fetched { image, source }),
            Err(e) => {
                tracing::error!(key = %key, error = %e, "Failed to serve image");
                Err(FetchError::Internal)
            }
        }
    }

    /// Queue a resize for `job` and wait for its completion.
    async fn fill(&self, job: &Job, key: &str) -> Result<(), FetchError> {
        // Compute the deadline before enqueueing so the whole miss path is
        // bounded by the configured timeout.
        let deadline = Instant::now() + self.wait_timeout;

        // Subscribed before the job exists, so its completion cannot be missed.
        let completion = self.bus.subscribe(key);

        if let Err(e) = self.queue.enqueue(job).await {
            tracing::error!(key = %key, error = %e, "Failed to enqueue resize job");
            return Err(FetchError::Internal);
        }

        match completion.wait(deadline).await {
            Ok(()) => Ok(()),
            Err(BusError::Timeout) => {
                // The completion event may have been lost in transit.
                if let Ok(CacheLookup::Hit) = self.cache.has(job).await {
                    tracing::warn!(key = %key, "Completion not observed but variant is cached");
                    return Ok(());
                }
                tracing::warn!(
                    key = %key,
                    timeout_ms = self.wait_timeout.as_millis() as u64,
                    "Resize not completed before timeout"
                );
                Err(FetchError::Unavailable)
            }
            Err(e) => {
                tracing::error!(key = %key, error = %e, "Failed waiting for resize");
                Err(FetchError::Internal)
            }
        }
    }
}
