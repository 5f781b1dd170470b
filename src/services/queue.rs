use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::models::job::Job;

/// Backlog of pending resize jobs shared by request handlers and workers.
///
/// First attempts are served in FIFO order. Retries go on a priority lane:
/// a job passed to [`JobQueue::enqueue_retry`] is the next one dequeued.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Submit a job for its first attempt.
    async fn enqueue(&self, job: &Job) -> Result<(), QueueError>;

    /// Resubmit a job whose processing failed.
    async fn enqueue_retry(&self, job: &Job) -> Result<(), QueueError>;

    /// Take one job, or `None` when nothing is pending.
    async fn dequeue(&self) -> Result<Option<Job>, QueueError>;

    /// Number of pending jobs.
    async fn depth(&self) -> Result<u64, QueueError>;

    /// Check backend connectivity (for health checks).
    async fn health_check(&self) -> Result<(), QueueError>;
}

/// Redis-backed job queue on a single list.
///
/// New jobs are pushed on the left and workers pop from the right; retries are
/// pushed on the right so they are popped first.
pub struct RedisJobQueue {
    conn: MultiplexedConnection,
    key: String,
}

impl RedisJobQueue {
    pub async fn connect(client: &redis::Client, key: impl Into<String>) -> Result<Self, QueueError> {
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self {
            conn,
            key: key.into(),
        })
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(&self, job: &Job) -> Result<(), QueueError> {
        let payload = serde_json::to_string(job)?;
        let mut conn = self.conn.clone();
        conn.lpush::<_, _, ()>(&self.key, &payload).await?;
        Ok(())
    }

    async fn enqueue_retry(&self, job: &Job) -> Result<(), QueueError> {
        let payload = serde_json::to_string(job)?;
        let mut conn = self.conn.clone();
        conn.rpush::<_, _, ()>(&self.key, &payload).await?;
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<Job>, QueueError> {
        let mut conn = self.conn.clone();
        let result: Option<String> = conn.rpop(&self.key, None).await?;

        match result {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.conn.clone();
        let depth: u64 = conn.llen(&self.key).await?;
        Ok(depth)
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}

/// In-process queue with the same ordering as [`RedisJobQueue`].
#[derive(Default)]
pub struct MemoryJobQueue {
    jobs: Mutex<VecDeque<String>>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, VecDeque<String>>, QueueError> {
        self.jobs.lock().map_err(|_| QueueError::Poisoned)
    }
}

// Entries are stored serialized so this backing exercises the same payload
// encoding as Redis.
#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, job: &Job) -> Result<(), QueueError> {
        let payload = serde_json::to_string(job)?;
        self.lock()?.push_back(payload);
        Ok(())
    }

    async fn enqueue_retry(&self, job: &Job) -> Result<(), QueueError> {
        let payload = serde_json::to_string(job)?;
        self.lock()?.push_front(payload);
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<Job>, QueueError> {
        let payload = self.lock()?.pop_front();
        match payload {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        Ok(self.lock()?.len() as u64)
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        self.lock().map(|_| ())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Queue lock poisoned")]
    Poisoned,
}
