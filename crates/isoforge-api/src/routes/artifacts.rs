//! Signed artifact downloads.

use axum::Router;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use chrono::Utc;
use isoforge_core::BuildId;
use serde::Deserialize;
use tracing::info;

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new().route("/{id}/{file}", get(download))
}

#[derive(Debug, Deserialize)]
struct SignedQuery {
    expires: i64,
    signature: String,
}

async fn download(
    State(state): State<AppState>,
    Path((id, file)): Path<(BuildId, String)>,
    Query(query): Query<SignedQuery>,
) -> Result<Response, ApiError> {
    let delivery = state.builds.delivery();
    let artifact = delivery
        .verify(id, &file, query.expires, &query.signature, Utc::now())
        .await?;
    let stream = delivery.open(&artifact).await?;

    info!(build_id = %id, file = %file, size = artifact.size, "Serving artifact");
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_LENGTH, artifact.size.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", artifact.file_name()),
            ),
        ],
        Body::from_stream(stream),
    )
        .into_response())
}
