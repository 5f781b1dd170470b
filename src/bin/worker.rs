//! Standalone resize workers.
//!
//! Shares the server's Redis queue, completion channel and cache directory so
//! resizing can be scaled out separately from request handling.

use imgrsz::{
    config::AppConfig,
    services::{
        cache::FsImageCache, completion::RedisCompletionBus, queue::RedisJobQueue,
        resize::ImageResizer, worker::{ResizeWorker, WorkerPool},
    },
};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting resize worker process");

    // Load configuration
    let config = AppConfig::from_env().expect("Failed to load configuration");

    tracing::info!("Connecting to Redis");
    let redis = redis::Client::open(config.redis_url.as_str()).expect("Invalid Redis URL");
    let queue = RedisJobQueue::connect(&redis, config.queue_key.clone())
        .await
        .expect("Failed to initialize job queue");
    let bus = Arc::new(
        RedisCompletionBus::connect(&redis, config.done_channel.clone(), config.waiter_ttl())
            .await
            .expect("Failed to initialize completion bus"),
    );

    let worker = Arc::new(ResizeWorker::new(
        Arc::new(queue),
        Arc::new(FsImageCache::new(&config.cache_dir)),
        bus.clone(),
        Arc::new(ImageResizer::default()),
        config.idle_backoff(),
    ));

    let count = config.workers.max(1);
    let pool = WorkerPool::spawn(count, worker);
    tracing::info!(workers = count, "Workers ready, starting job processing loop");

    // Wait for signal interrupt
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }

    tracing::info!("Shutdown signal received");
    pool.shutdown().await;
    bus.shutdown();
}
