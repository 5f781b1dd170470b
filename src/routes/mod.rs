use axum::{middleware, routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::app_state::AppState;

pub mod health;
pub mod image;
pub mod metrics;

/// Build the service router. The `/metrics` route is only mounted when a
/// Prometheus recorder handle is supplied.
pub fn router(state: AppState, prometheus: Option<Arc<PrometheusHandle>>) -> Router {
    let app = Router::new()
        .route("/health", get(health::health_check))
        .route(
            "/image/{filename}",
            get(image::get_image).layer(middleware::from_fn(image::track_response_time)),
        )
        .with_state(state);

    let app = match prometheus {
        Some(handle) => app.route(
            "/metrics",
            get(metrics::prometheus_metrics).with_state(handle),
        ),
        None => app,
    };

    app.layer(TraceLayer::new_for_http())
}
