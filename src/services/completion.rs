//! Completion bus: wakes request handlers when the resize job they queued has
//! been written to the cache.
//!
//! Workers broadcast the finished job key on one shared stream. Each process
//! runs a single dispatcher task that drains the stream into a [`WaiterTable`],
//! a concurrent map from key to a one-value "done" cell. Publish, dispatch and
//! wait all create-or-fetch the cell through the same map entry, so an event
//! that arrives before anyone waits is kept in the cell and a waiter that
//! arrives first finds the cell the dispatcher will later fill.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::{Stream, StreamExt};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Capacity of the in-process broadcast feed.
const LOCAL_FEED_CAPACITY: usize = 1024;

/// Pause before re-subscribing after the Redis pub/sub stream ends.
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// Lower bound on the sweep interval of the waiter table.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(100);

/// Per-key completion notifications.
#[async_trait]
pub trait CompletionBus: Send + Sync {
    /// Announce that the job with `key` is done.
    async fn publish(&self, key: &str) -> Result<(), BusError>;

    /// Attach to the waiter slot for `key`. Every completion deposited into
    /// that slot is observed by the returned handle, even if another waiter
    /// consumes the slot first.
    fn subscribe(&self, key: &str) -> Completion;

    /// Block until a completion for `key` is observed or `deadline` passes.
    ///
    /// A completion published before the call is still observed as long as
    /// its waiter entry has not expired. Dropping the future abandons the
    /// wait without affecting other waiters.
    async fn wait(&self, key: &str, deadline: Instant) -> Result<(), BusError> {
        self.subscribe(key).wait(deadline).await
    }
}

type Slot = Arc<watch::Sender<bool>>;

struct Waiter {
    slot: Slot,
    expires_at: Instant,
}

/// Concurrent key -> waiter map with a fixed time-to-live per entry.
///
/// Every access pushes an entry's expiry to `now + ttl`; since the ttl is never
/// shorter than a request's wait timeout, an entry cannot expire under a live
/// waiter.
pub struct WaiterTable {
    waiters: DashMap<String, Waiter>,
    ttl: Duration,
}

impl WaiterTable {
    pub fn new(ttl: Duration) -> Self {
        Self {
            waiters: DashMap::new(),
            ttl,
        }
    }

    /// Fetch the live slot for `key`, creating it (or replacing an expired
    /// one) under the map's shard lock.
    fn slot(&self, key: &str) -> Slot {
        let now = Instant::now();
        let expires_at = now + self.ttl;

        match self.waiters.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                let waiter = entry.get_mut();
                if waiter.expires_at <= now {
                    *waiter = Waiter {
                        slot: Arc::new(watch::channel(false).0),
                        expires_at,
                    };
                } else {
                    waiter.expires_at = expires_at;
                }
                waiter.slot.clone()
            }
            Entry::Vacant(entry) => {
                let slot: Slot = Arc::new(watch::channel(false).0);
                entry.insert(Waiter {
                    slot: slot.clone(),
                    expires_at,
                });
                slot
            }
        }
    }

    /// Make sure `key` has a slot so an early completion is not lost.
    pub fn ensure(&self, key: &str) {
        self.slot(key);
    }

    /// Mark `key` as done. Never blocks; repeated deposits coalesce.
    pub fn deposit(&self, key: &str) {
        self.slot(key).send_replace(true);
    }

    /// Hold on to the current slot for `key`.
    pub fn subscribe(self: &Arc<Self>, key: &str) -> Completion {
        let slot = self.slot(key);
        let done = slot.subscribe();
        Completion {
            table: self.clone(),
            key: key.to_string(),
            slot,
            done,
        }
    }

    /// Wait for `key` to be marked done.
    pub async fn wait(self: &Arc<Self>, key: &str, deadline: Instant) -> Result<(), BusError> {
        self.subscribe(key).wait(deadline).await
    }

    /// Drop every expired entry.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.waiters.retain(|_, waiter| waiter.expires_at > now);
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    fn sweep_interval(&self) -> Duration {
        (self.ttl / 2).max(MIN_SWEEP_INTERVAL)
    }
}

/// A subscription to one key's waiter slot.
pub struct Completion {
    table: Arc<WaiterTable>,
    key: String,
    slot: Slot,
    done: watch::Receiver<bool>,
}

impl Completion {
    /// Resolve once the slot is marked done, or fail at `deadline`. Every
    /// holder of the slot at the time of a deposit is woken; the first to
    /// return removes the slot so the next subscription starts a new session.
    pub async fn wait(mut self, deadline: Instant) -> Result<(), BusError> {
        let outcome = tokio::time::timeout_at(deadline, self.done.wait_for(|finished| *finished))
            .await
            .map(|observed| observed.map(|_| ()));

        match outcome {
            Ok(Ok(())) => {
                self.table
                    .waiters
                    .remove_if(&self.key, |_, waiter| Arc::ptr_eq(&waiter.slot, &self.slot));
                Ok(())
            }
            Ok(Err(_)) => Err(BusError::Closed),
            Err(_) => Err(BusError::Timeout),
        }
    }
}

/// Why the feed a dispatcher was draining stopped.
#[derive(Debug, PartialEq, Eq)]
enum DispatchEnd {
    Cancelled,
    StreamEnded,
}

/// Drain `keys` into `table` until the stream ends or `cancel` fires.
async fn dispatch<S>(table: &WaiterTable, mut keys: S, cancel: &CancellationToken) -> DispatchEnd
where
    S: Stream<Item = String> + Unpin,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return DispatchEnd::Cancelled,
            key = keys.next() => match key {
                Some(key) => {
                    tracing::trace!(key = %key, "Completion received");
                    table.deposit(&key);
                }
                None => return DispatchEnd::StreamEnded,
            },
        }
    }
}

/// Periodically remove expired waiters.
async fn sweep(table: Arc<WaiterTable>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(table.sweep_interval());
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => table.sweep(),
        }
    }
}

type KeyStream = Pin<Box<dyn Stream<Item = String> + Send>>;

/// Completion bus over a Redis pub/sub channel.
pub struct RedisCompletionBus {
    conn: MultiplexedConnection,
    channel: String,
    table: Arc<WaiterTable>,
    cancel: CancellationToken,
}

impl RedisCompletionBus {
    /// Subscribe to `channel` and start the dispatcher and sweeper tasks.
    pub async fn connect(
        client: &redis::Client,
        channel: impl Into<String>,
        ttl: Duration,
    ) -> Result<Self, BusError> {
        let channel = channel.into();
        let conn = client.get_multiplexed_async_connection().await?;
        let keys = subscribe(client, &channel).await?;

        let table = Arc::new(WaiterTable::new(ttl));
        let cancel = CancellationToken::new();

        tokio::spawn(run_redis_dispatcher(
            client.clone(),
            channel.clone(),
            keys,
            table.clone(),
            cancel.clone(),
        ));
        tokio::spawn(sweep(table.clone(), cancel.clone()));

        tracing::info!(channel = %channel, ttl_ms = ttl.as_millis() as u64, "Completion bus subscribed");

        Ok(Self {
            conn,
            channel,
            table,
            cancel,
        })
    }

    /// Stop the dispatcher and sweeper.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for RedisCompletionBus {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn subscribe(client: &redis::Client, channel: &str) -> Result<KeyStream, BusError> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.psubscribe(channel).await?;

    let keys = pubsub.into_on_message().filter_map(|msg| {
        let key = match msg.get_payload::<String>() {
            Ok(key) => Some(key),
            Err(e) => {
                tracing::warn!(error = %e, "Dropping non-text completion payload");
                None
            }
        };
        futures::future::ready(key)
    });

    Ok(Box::pin(keys))
}

async fn run_redis_dispatcher(
    client: redis::Client,
    channel: String,
    mut keys: KeyStream,
    table: Arc<WaiterTable>,
    cancel: CancellationToken,
) {
    loop {
        if dispatch(&table, &mut keys, &cancel).await == DispatchEnd::Cancelled {
            return;
        }
        tracing::warn!(channel = %channel, "Completion stream ended, resubscribing");

        // Completions published while disconnected are lost; their waiters
        // time out.
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => {}
            }
            match subscribe(&client, &channel).await {
                Ok(stream) => {
                    keys = stream;
                    tracing::info!(channel = %channel, "Completion bus resubscribed");
                    break;
                }
                Err(e) => {
                    tracing::error!(channel = %channel, error = %e, "Failed to resubscribe");
                }
            }
        }
    }
}

#[async_trait]
impl CompletionBus for RedisCompletionBus {
    async fn publish(&self, key: &str) -> Result<(), BusError> {
        self.table.ensure(key);
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(&self.channel, key).await?;
        Ok(())
    }

    fn subscribe(&self, key: &str) -> Completion {
        self.table.subscribe(key)
    }
}

/// Completion bus over an in-process broadcast channel, for a server that
/// runs its own workers or for tests.
pub struct LocalCompletionBus {
    feed: broadcast::Sender<String>,
    table: Arc<WaiterTable>,
    cancel: CancellationToken,
}

impl LocalCompletionBus {
    pub fn new(ttl: Duration) -> Self {
        let (feed, receiver) = broadcast::channel(LOCAL_FEED_CAPACITY);
        let table = Arc::new(WaiterTable::new(ttl));
        let cancel = CancellationToken::new();

        let keys = futures::stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(key) => return Some((key, receiver)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Completion dispatcher lagged, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        let dispatcher_table = table.clone();
        let dispatcher_cancel = cancel.clone();
        tokio::spawn(async move {
            let keys = Box::pin(keys);
            dispatch(&dispatcher_table, keys, &dispatcher_cancel).await;
        });
        tokio::spawn(sweep(table.clone(), cancel.clone()));

        Self {
            feed,
            table,
            cancel,
        }
    }

    /// Stop the dispatcher and sweeper.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Live entries in the waiter table.
    pub fn pending_waiters(&self) -> usize {
        self.table.len()
    }
}

impl Drop for LocalCompletionBus {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl CompletionBus for LocalCompletionBus {
    async fn publish(&self, key: &str) -> Result<(), BusError> {
        self.table.ensure(key);
        self.feed
            .send(key.to_string())
            .map_err(|_| BusError::Closed)?;
        Ok(())
    }

    fn subscribe(&self, key: &str) -> Completion {
        self.table.subscribe(key)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Timed out waiting for completion")]
    Timeout,

    #[error("Completion feed closed")]
    Closed,

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}
