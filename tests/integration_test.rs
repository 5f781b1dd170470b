//! Router-level tests over in-memory backends, plus Redis backend tests.
//!
//! The Redis tests require a running Redis instance configured via
//! IMGRESIZER_REDIS_URL (default redis://127.0.0.1:6379/0).
//! Run them with: cargo test --test integration_test -- --ignored

mod fixtures;
mod helpers;

use axum::http::StatusCode;
use fixtures::*;
use helpers::*;
use image::GenericImageView;
use imgrsz::app_state::AppState;
use imgrsz::models::job::Job;
use imgrsz::routes;
use imgrsz::services::cache::FsImageCache;
use imgrsz::services::completion::{
    BusError, CompletionBus, LocalCompletionBus, RedisCompletionBus,
};
use imgrsz::services::queue::{JobQueue, QueueError, RedisJobQueue};
use std::sync::Arc;
use std::time::{Duration, Instant};

const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_original_is_served_unchanged() {
    let app = spawn_app(1, WAIT_TIMEOUT);

    let response = app.get("/image/cat.jpg").await;

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body.as_ref(), LANDSCAPE_JPEG.bytes().as_slice());
    assert_eq!(response.header("content-type"), Some("image/jpeg"));
    assert_eq!(
        response.header("content-length"),
        Some(response.body.len().to_string().as_str())
    );
    assert!(response.header("last-modified").is_some());
}

#[tokio::test]
async fn test_resize_then_cache_hit() {
    let mut app = spawn_app(2, WAIT_TIMEOUT);

    let first = app.get("/image/cat.jpg?size=150x150").await;
    assert_eq!(first.status, StatusCode::OK);

    let img = image::load_from_memory(&first.body).expect("Failed to decode resized image");
    assert_eq!(img.width(), 150);
    assert_eq!(img.dimensions(), (150, 100));
    assert!(app.cached_path("cat_150x150.jpg").exists());

    let last_modified = first
        .header("last-modified")
        .expect("expected non empty last-modified header")
        .to_string();

    // Without workers a miss would time out, so a 200 here is a cache hit.
    app.stop_workers().await;
    let second = app.get("/image/cat.jpg?size=150x150").await;

    assert_eq!(second.status, StatusCode::OK);
    assert_eq!(second.header("last-modified"), Some(last_modified.as_str()));
    assert_eq!(second.body, first.body);
    assert_eq!(app.queue.depth().await.unwrap(), 0);
}

#[tokio::test]
async fn test_png_variant_keeps_format() {
    let app = spawn_app(1, WAIT_TIMEOUT);

    let response = app.get("/image/tower.png?size=60x60").await;

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.header("content-type"), Some("image/png"));
    let img = image::load_from_memory(&response.body).unwrap();
    assert_eq!(img.dimensions(), (30, 60));
}

#[tokio::test]
async fn test_missing_original_is_404() {
    let app = spawn_app(1, WAIT_TIMEOUT);

    assert_eq!(app.get("/image/missing.jpg").await.status, StatusCode::NOT_FOUND);
    assert_eq!(
        app.get("/image/missing.jpg?size=10x10").await.status,
        StatusCode::NOT_FOUND
    );
    assert_eq!(app.queue.depth().await.unwrap(), 0);
}

#[tokio::test]
async fn test_malformed_size_is_400() {
    let app = spawn_app(1, WAIT_TIMEOUT);

    for uri in [
        "/image/cat.jpg?size=abcxdef",
        "/image/cat.jpg?size=123xdf123a",
        "/image/cat.jpg?size=150",
        "/image/missing.jpg?size=abcxdef",
    ] {
        let response = app.get(uri).await;
        assert_eq!(response.status, StatusCode::BAD_REQUEST, "{uri}");
    }
    assert_eq!(app.queue.depth().await.unwrap(), 0);
}

#[tokio::test]
async fn test_path_traversal_is_404() {
    let app = spawn_app(1, WAIT_TIMEOUT);

    let response = app.get("/image/..%2Fcat.jpg").await;
    assert_eq!(response.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_stopped_workers_yield_503_after_timeout() {
    let timeout = Duration::from_millis(200);
    let app = spawn_app(0, timeout);

    let started = Instant::now();
    let response = app.get("/image/cat.jpg?size=40x40").await;

    assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(started.elapsed() >= timeout);
    assert!(!app.cached_path("cat_40x40.jpg").exists());
    // The job is still queued for a worker to finish later.
    assert_eq!(app.queue.depth().await.unwrap(), 1);
}

#[tokio::test]
async fn test_concurrent_requests_for_same_variant() {
    let app = Arc::new(spawn_app(2, WAIT_TIMEOUT));

    let requests: Vec<_> = (0..5)
        .map(|_| {
            let app = app.clone();
            tokio::spawn(async move { app.get("/image/cat.jpg?size=75x75").await.status })
        })
        .collect();

    for request in requests {
        assert_eq!(request.await.unwrap(), StatusCode::OK);
    }
}

#[tokio::test]
async fn test_health_check() {
    let app = spawn_app(0, WAIT_TIMEOUT);

    let response = app.get("/health").await;
    assert_eq!(response.status, StatusCode::OK);

    let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["checks"]["queue"]["status"], "ok");
    assert_eq!(body["checks"]["cache"]["status"], "ok");
}

/// Queue backend that rejects every command
struct BrokenQueue;

#[async_trait::async_trait]
impl JobQueue for BrokenQueue {
    async fn enqueue(&self, _job: &Job) -> Result<(), QueueError> {
        Err(QueueError::Poisoned)
    }

    async fn enqueue_retry(&self, _job: &Job) -> Result<(), QueueError> {
        Err(QueueError::Poisoned)
    }

    async fn dequeue(&self) -> Result<Option<Job>, QueueError> {
        Err(QueueError::Poisoned)
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        Err(QueueError::Poisoned)
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        Err(QueueError::Poisoned)
    }
}

#[tokio::test]
async fn test_queue_outage_is_500_and_degraded() {
    let dir = seeded_cache_dir();
    let state = AppState::new(
        Arc::new(BrokenQueue),
        Arc::new(FsImageCache::new(dir.path())),
        Arc::new(LocalCompletionBus::new(Duration::from_secs(30))),
        WAIT_TIMEOUT,
    );
    let router = routes::router(state, None);

    let started = Instant::now();
    let response = send_get(&router, "/image/cat.jpg?size=50x50").await;
    assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(started.elapsed() < WAIT_TIMEOUT);

    // Cache hits do not touch the queue.
    let original = send_get(&router, "/image/cat.jpg").await;
    assert_eq!(original.status, StatusCode::OK);

    let health = send_get(&router, "/health").await;
    assert_eq!(health.status, StatusCode::SERVICE_UNAVAILABLE);
    let body: serde_json::Value = serde_json::from_slice(&health.body).unwrap();
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["checks"]["queue"]["status"], "error");
}

fn redis_client() -> redis::Client {
    let url = std::env::var("IMGRESIZER_REDIS_URL")
        .unwrap_or_else(|_| "redis://127.0.0.1:6379/0".to_string());
    redis::Client::open(url).expect("Invalid Redis URL")
}

/// Redis queue: FIFO for first attempts, retries served first
#[tokio::test]
#[ignore] // Requires a running Redis
async fn test_redis_queue_ordering() {
    let client = redis_client();
    let key = format!("test:queue:{}", uuid::Uuid::new_v4());
    let queue = RedisJobQueue::connect(&client, key.clone())
        .await
        .expect("Failed to connect queue");

    queue.health_check().await.expect("Redis not reachable");
    assert!(queue.dequeue().await.unwrap().is_none());

    let first = Job::resized("a.jpg", 10, 10);
    let second = Job::resized("b.jpg", 20, 20);
    let retried = Job::resized("c.jpg", 30, 30);
    queue.enqueue(&first).await.unwrap();
    queue.enqueue(&second).await.unwrap();
    queue.enqueue_retry(&retried).await.unwrap();
    assert_eq!(queue.depth().await.unwrap(), 3);

    assert_eq!(queue.dequeue().await.unwrap(), Some(retried));
    assert_eq!(queue.dequeue().await.unwrap(), Some(first));
    assert_eq!(queue.dequeue().await.unwrap(), Some(second));
    assert!(queue.dequeue().await.unwrap().is_none());
}

/// Redis bus: buffered delivery, live delivery and timeouts
#[tokio::test]
#[ignore] // Requires a running Redis
async fn test_redis_completion_bus() {
    let client = redis_client();
    let channel = format!("test:processed:{}", uuid::Uuid::new_v4());
    let bus = RedisCompletionBus::connect(&client, channel, Duration::from_secs(10))
        .await
        .expect("Failed to connect completion bus");

    let deadline = || tokio::time::Instant::now() + Duration::from_secs(2);

    bus.publish("early_1x1.jpg").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    bus.wait("early_1x1.jpg", deadline()).await.unwrap();

    let (waited, published) = tokio::join!(bus.wait("late_1x1.jpg", deadline()), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        bus.publish("late_1x1.jpg").await
    });
    published.unwrap();
    waited.unwrap();

    let short = tokio::time::Instant::now() + Duration::from_millis(100);
    assert!(matches!(bus.wait("never_1x1.jpg", short).await, Err(BusError::Timeout)));

    bus.shutdown();
}
