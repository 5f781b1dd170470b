use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use imgrsz::{
    app_state::AppState,
    config::AppConfig,
    routes,
    services::{
        cache::{self, FsImageCache, ImageCache},
        completion::RedisCompletionBus,
        queue::RedisJobQueue,
        resize::ImageResizer,
        worker::{ResizeWorker, WorkerPool},
    },
};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing imgrsz server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);
    routes::metrics::describe();

    // Prepare the cache directory
    tokio::fs::create_dir_all(&config.cache_dir)
        .await
        .expect("Failed to create cache directory");
    let cache: Arc<dyn ImageCache> = Arc::new(FsImageCache::new(&config.cache_dir));

    match cache.count().await {
        Ok(count) => {
            metrics::counter!("imgresizer_initial_images").increment(count as u64);
            tracing::info!(images = count, cache_dir = %config.cache_dir.display(), "Cache directory scanned");
        }
        Err(e) => tracing::warn!(error = %e, "Failed to count initial images"),
    }

    // Connect the Redis job queue and completion bus
    tracing::info!("Connecting to Redis");
    let redis = redis::Client::open(config.redis_url.as_str()).expect("Invalid Redis URL");
    let queue = Arc::new(
        RedisJobQueue::connect(&redis, config.queue_key.clone())
            .await
            .expect("Failed to initialize job queue"),
    );
    let bus = Arc::new(
        RedisCompletionBus::connect(&redis, config.done_channel.clone(), config.waiter_ttl())
            .await
            .expect("Failed to initialize completion bus"),
    );

    // Start in-process resize workers
    let worker = Arc::new(ResizeWorker::new(
        queue.clone(),
        cache.clone(),
        bus.clone(),
        Arc::new(ImageResizer::default()),
        config.idle_backoff(),
    ));
    let pool = WorkerPool::spawn(config.workers, worker);

    // Keep the image gauge current
    let background = CancellationToken::new();
    tokio::spawn(cache::watch_image_count(
        cache.clone(),
        config.count_interval(),
        background.clone(),
    ));

    let state = AppState::new(queue, cache, bus.clone(), config.wait_timeout());
    let app = routes::router(state, Some(prometheus_handle));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    tracing::info!("Shutting down");
    background.cancel();
    pool.shutdown().await;
    bus.shutdown();
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
