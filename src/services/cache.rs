use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::models::job::Job;

const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

/// Result of looking a job up in the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLookup {
    /// The requested variant is stored.
    Hit,
    /// The variant is missing but its original exists, so it can be produced.
    Miss,
    /// The original does not exist; the request can never be served.
    OriginalMissing,
}

/// An open cache entry ready to be streamed to a client.
#[derive(Debug)]
pub struct ServedImage {
    pub file: fs::File,
    pub content_type: &'static str,
    pub content_length: u64,
    pub last_modified: DateTime<Utc>,
}

impl ServedImage {
    /// `Last-Modified` value in IMF-fixdate form.
    pub fn last_modified_header(&self) -> String {
        http_date(&self.last_modified)
    }
}

fn http_date(at: &DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Store of originals and resized variants, addressed by [`Job::name`].
#[async_trait]
pub trait ImageCache: Send + Sync {
    async fn has(&self, job: &Job) -> Result<CacheLookup, CacheError>;

    /// Store `content` under `job.name()`. Empty content is a no-op.
    async fn save(&self, job: &Job, content: &[u8]) -> Result<(), CacheError>;

    /// Read the bytes stored under `job.name()`.
    async fn load(&self, job: &Job) -> Result<Vec<u8>, CacheError>;

    /// Open the entry for `job.name()` for streaming.
    async fn serve(&self, job: &Job) -> Result<ServedImage, CacheError>;

    /// Number of stored images.
    async fn count(&self) -> Result<usize, CacheError>;

    /// Check the backing storage is reachable (for health checks).
    async fn health_check(&self) -> Result<(), CacheError>;
}

/// Image cache on a flat local directory.
///
/// Writes go to a hidden temporary file that is renamed into place, so
/// readers never observe a partially written entry.
pub struct FsImageCache {
    base: PathBuf,
}

impl FsImageCache {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Resolve `name` inside the cache directory. Only single, visible path
    /// components are accepted.
    fn path_for(&self, name: &str) -> Option<PathBuf> {
        let plain = !name.is_empty()
            && !name.starts_with('.')
            && !name.contains(['/', '\\', '\0']);
        plain.then(|| self.base.join(name))
    }

    async fn is_file(path: &Path) -> Result<bool, CacheError> {
        match fs::metadata(path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CacheError::Io(e)),
        }
    }

    fn readable_path(&self, name: &str) -> Result<PathBuf, CacheError> {
        self.path_for(name)
            .ok_or_else(|| CacheError::NotFound(name.to_string()))
    }
}

fn not_found_or_io(name: &str, e: std::io::Error) -> CacheError {
    if e.kind() == ErrorKind::NotFound {
        CacheError::NotFound(name.to_string())
    } else {
        CacheError::Io(e)
    }
}

/// Write `content` to `staging`, flush it to disk and move it over `target`.
async fn write_and_rename(staging: &Path, target: &Path, content: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(staging).await?;
    file.write_all(content).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(staging, target).await
}

fn content_type_for(name: &str) -> &'static str {
    image::ImageFormat::from_path(name)
        .map(|format| format.to_mime_type())
        .unwrap_or(FALLBACK_CONTENT_TYPE)
}

#[async_trait]
impl ImageCache for FsImageCache {
    async fn has(&self, job: &Job) -> Result<CacheLookup, CacheError> {
        let Some(variant) = self.path_for(&job.name()) else {
            return Ok(CacheLookup::OriginalMissing);
        };
        if Self::is_file(&variant).await? {
            return Ok(CacheLookup::Hit);
        }

        let Some(original) = self.path_for(&job.original) else {
            return Ok(CacheLookup::OriginalMissing);
        };
        if !job.is_original && Self::is_file(&original).await? {
            Ok(CacheLookup::Miss)
        } else {
            Ok(CacheLookup::OriginalMissing)
        }
    }

    async fn save(&self, job: &Job, content: &[u8]) -> Result<(), CacheError> {
        if content.is_empty() {
            return Ok(());
        }

        let name = job.name();
        let target = self
            .path_for(&name)
            .ok_or_else(|| CacheError::InvalidName(name.clone()))?;
        let staging = self.base.join(format!(".{}.{}.tmp", name, Uuid::new_v4()));

        if let Err(e) = write_and_rename(&staging, &target, content).await {
            let _ = fs::remove_file(&staging).await;
            return Err(CacheError::Io(e));
        }

        tracing::debug!(key = %name, bytes = content.len(), "Cache entry written");
        Ok(())
    }

    async fn load(&self, job: &Job) -> Result<Vec<u8>, CacheError> {
        let name = job.name();
        let path = self.readable_path(&name)?;
        fs::read(&path).await.map_err(|e| not_found_or_io(&name, e))
    }

    async fn serve(&self, job: &Job) -> Result<ServedImage, CacheError> {
        let name = job.name();
        let path = self.readable_path(&name)?;

        let file = fs::File::open(&path)
            .await
            .map_err(|e| not_found_or_io(&name, e))?;
        let meta = file.metadata().await?;
        if !meta.is_file() {
            return Err(CacheError::NotFound(name));
        }

        Ok(ServedImage {
            file,
            content_type: content_type_for(&name),
            content_length: meta.len(),
            last_modified: DateTime::<Utc>::from(meta.modified()?),
        })
    }

    async fn count(&self) -> Result<usize, CacheError> {
        let mut entries = fs::read_dir(&self.base).await?;
        let mut count = 0;
        while let Some(entry) = entries.next_entry().await? {
            let hidden = entry.file_name().to_string_lossy().starts_with('.');
            if !hidden && entry.file_type().await?.is_file() {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn health_check(&self) -> Result<(), CacheError> {
        let meta = fs::metadata(&self.base).await?;
        if meta.is_dir() {
            Ok(())
        } else {
            Err(CacheError::NotFound(self.base.display().to_string()))
        }
    }
}

/// Keep the `imgresizer_current_images` gauge in line with the cache
/// directory until `cancel` fires.
pub async fn watch_image_count(
    cache: Arc<dyn ImageCache>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => match cache.count().await {
                Ok(count) => metrics::gauge!("imgresizer_current_images").set(count as f64),
                Err(e) => tracing::warn!(error = %e, "Failed to count images"),
            },
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Image not found: {0}")]
    NotFound(String),

    #[error("Invalid image name: {0}")]
    InvalidName(String),

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}
