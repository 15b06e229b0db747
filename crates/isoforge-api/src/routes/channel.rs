//! Worker-facing status gateway.
//!
//! Workers hold no database credentials; they write their status record
//! here with the per-build token they were started with. The gateway only
//! overwrites the channel record. The ingestor decides what it means for
//! the build.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::routing::put;
use axum::{Json, Router};
use isoforge_core::BuildId;
use isoforge_core::channel::StatusRecord;
use tracing::{debug, warn};

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new().route("/builds/{id}/status", put(put_status))
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

async fn put_status(
    State(state): State<AppState>,
    Path(id): Path<BuildId>,
    headers: HeaderMap,
    body: Result<Json<StatusRecord>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let authorized = bearer_token(&headers)
        .is_some_and(|token| state.signer.verify_channel_token(id, token));
    if !authorized {
        warn!(build_id = %id, "Rejected status write with missing or invalid token");
        return Err(ApiError::Unauthorized("invalid status token".to_string()));
    }

    let Json(record) = body?;
    record.validate()?;
    state.channel.publish(id, &record).await?;

    debug!(build_id = %id, progress = record.progress, stage = %record.stage, "Status record written");
    Ok(StatusCode::NO_CONTENT)
}
