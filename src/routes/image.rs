use axum::body::Body;
use axum::extract::{Path, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tokio_util::io::ReaderStream;

use crate::app_state::AppState;
use crate::services::cache::ServedImage;
use crate::services::coordinator::FetchError;

#[derive(Debug, Deserialize)]
pub struct ImageQuery {
    pub size: Option<String>,
}

/// GET /image/{filename}?size=WxH: serve an original or a resized variant.
pub async fn get_image(
    State(state): State<AppState>,
    Path(filename): Path<String>,
    Query(query): Query<ImageQuery>,
) -> Result<ServedImage, FetchError> {
    let fetched = state
        .coordinator
        .fetch(&filename, query.size.as_deref())
        .await?;
    Ok(fetched.image)
}

/// Records response time per status code for the image route.
pub async fn track_response_time(request: Request, next: Next) -> Response {
    let start = std::time::Instant::now();
    let response = next.run(request).await;

    metrics::histogram!(
        "imgresizer_response_seconds",
        "status" => response.status().as_u16().to_string()
    )
    .record(start.elapsed().as_secs_f64());

    response
}

impl IntoResponse for ServedImage {
    fn into_response(self) -> Response {
        let last_modified = self.last_modified_header();
        let headers = [
            (header::CONTENT_TYPE, self.content_type.to_string()),
            (header::CONTENT_LENGTH, self.content_length.to_string()),
            (header::LAST_MODIFIED, last_modified),
        ];
        let body = Body::from_stream(ReaderStream::new(self.file));

        (StatusCode::OK, headers, body).into_response()
    }
}

impl IntoResponse for FetchError {
    fn into_response(self) -> Response {
        let status = match &self {
            FetchError::Validation(_) => StatusCode::BAD_REQUEST,
            FetchError::NotFound => StatusCode::NOT_FOUND,
            FetchError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            FetchError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = match self {
            FetchError::Validation(_) => "size must be formatted as 123x123".to_string(),
            other => other.to_string(),
        };

        (status, message).into_response()
    }
}
