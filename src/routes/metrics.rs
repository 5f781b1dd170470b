use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

/// Prometheus metrics scrape endpoint.
/// Returns metrics in Prometheus text exposition format.
pub async fn prometheus_metrics(
    axum::extract::State(handle): axum::extract::State<Arc<PrometheusHandle>>,
) -> impl IntoResponse {
    handle.render()
}

/// Register descriptions for the service's metrics.
pub fn describe() {
    metrics::describe_counter!(
        "imgresizer_initial_images",
        "Number of images in the cache directory at startup"
    );
    metrics::describe_counter!("imgresizer_resized_images", "Cache misses resolved by a resize");
    metrics::describe_counter!("imgresizer_cache_hits", "Requests served straight from the cache");
    metrics::describe_counter!("imgresizer_cache_misses", "Requests that queued a resize job");
    metrics::describe_counter!("imgresizer_jobs_retried", "Resize jobs re-queued after a failure");
    metrics::describe_gauge!("imgresizer_current_images", "Images currently in the cache directory");
    metrics::describe_histogram!(
        "imgresizer_response_seconds",
        "Image request latency by response status"
    );
}
