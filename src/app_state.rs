use std::sync::Arc;
use std::time::Duration;

use crate::services::{
    cache::ImageCache, completion::CompletionBus, coordinator::Coordinator, queue::JobQueue,
};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub queue: Arc<dyn JobQueue>,
    pub cache: Arc<dyn ImageCache>,
}

impl AppState {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        cache: Arc<dyn ImageCache>,
        bus: Arc<dyn CompletionBus>,
        wait_timeout: Duration,
    ) -> Self {
        let coordinator = Coordinator::new(queue.clone(), cache.clone(), bus, wait_timeout);
        Self {
            coordinator: Arc::new(coordinator),
            queue,
            cache,
        }
    }
}
