//! Test helper utilities: an in-process service over in-memory backends

#![allow(dead_code)]

use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::Router;
use imgrsz::{
    app_state::AppState,
    routes,
    services::{
        cache::FsImageCache,
        completion::LocalCompletionBus,
        queue::MemoryJobQueue,
        resize::ImageResizer,
        worker::{ResizeWorker, WorkerPool},
    },
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

use crate::fixtures::TEST_FIXTURES;

/// Waiter TTL used by test buses
const TEST_WAITER_TTL: Duration = Duration::from_secs(30);

/// A running service with its backends exposed for inspection
pub struct TestApp {
    pub dir: TempDir,
    pub router: Router,
    pub queue: Arc<MemoryJobQueue>,
    pub bus: Arc<LocalCompletionBus>,
    pub pool: Option<WorkerPool>,
}

/// Response pieces a test cares about
pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TestResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Start the service with every fixture image in a fresh cache directory and
/// `workers` resize workers.
pub fn spawn_app(workers: usize, wait_timeout: Duration) -> TestApp {
    let dir = seeded_cache_dir();

    let queue = Arc::new(MemoryJobQueue::new());
    let cache = Arc::new(FsImageCache::new(dir.path()));
    let bus = Arc::new(LocalCompletionBus::new(TEST_WAITER_TTL));

    let pool = (workers > 0).then(|| {
        let worker = Arc::new(ResizeWorker::new(
            queue.clone(),
            cache.clone(),
            bus.clone(),
            Arc::new(ImageResizer::default()),
            Duration::from_millis(5),
        ));
        WorkerPool::spawn(workers, worker)
    });

    let state = AppState::new(queue.clone(), cache, bus.clone(), wait_timeout);
    let router = routes::router(state, None);

    TestApp {
        dir,
        router,
        queue,
        bus,
        pool,
    }
}

/// A fresh cache directory holding every fixture image
pub fn seeded_cache_dir() -> TempDir {
    let dir = tempfile::tempdir().expect("Failed to create cache directory");
    for fixture in TEST_FIXTURES {
        std::fs::write(dir.path().join(fixture.filename), fixture.bytes())
            .expect("Failed to write fixture");
    }
    dir
}

/// Issue a GET against `router`
pub async fn send_get(router: &Router, uri: &str) -> TestResponse {
    let request = Request::builder()
        .uri(uri)
        .body(Body::empty())
        .expect("Failed to build request");

    let response = router
        .clone()
        .oneshot(request)
        .await
        .expect("Router failed");

    let status = response.status();
    let headers = response.headers().clone();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("Failed to read body");

    TestResponse {
        status,
        headers,
        body,
    }
}

impl TestApp {
    /// Issue a GET against the router
    pub async fn get(&self, uri: &str) -> TestResponse {
        send_get(&self.router, uri).await
    }

    /// Stop the resize workers, if any
    pub async fn stop_workers(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.shutdown().await;
        }
    }

    pub fn cached_path(&self, name: &str) -> std::path::PathBuf {
        self.dir.path().join(name)
    }
}
