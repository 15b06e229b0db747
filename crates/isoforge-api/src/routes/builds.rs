//! Caller-facing build endpoints.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use isoforge_config::BuildRequest;
use isoforge_core::artifact::ArtifactRef;
use isoforge_core::{Build, BuildConfig, BuildError, BuildId, BuildStatus};
use isoforge_scheduler::DownloadGrant;
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::ApiError;

/// Log lines returned by a poll unless `?logs=` says otherwise.
const DEFAULT_LOG_LINES: usize = 20;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_builds).post(submit_build))
        .route("/{id}", get(get_build))
        .route("/{id}/download", get(download_build))
        .route("/{id}/cancel", post(cancel_build))
}

#[derive(Debug, Serialize)]
struct SubmitResponse {
    build_id: BuildId,
    status: BuildStatus,
    estimated_duration_secs: u64,
    config: BuildConfig,
}

async fn submit_build(
    State(state): State<AppState>,
    body: Result<Json<BuildRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let Json(request) = body?;
    let build = state.builds.submit(&request).await?;
    Ok((
        StatusCode::CREATED,
        Json(SubmitResponse {
            build_id: build.id,
            status: build.status,
            estimated_duration_secs: build.estimated_duration_secs,
            config: build.config,
        }),
    ))
}

#[derive(Debug, Deserialize)]
struct GetBuildQuery {
    logs: Option<usize>,
}

#[derive(Debug, Serialize)]
struct BuildResponse {
    build_id: BuildId,
    status: BuildStatus,
    progress: u8,
    stage: String,
    logs: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    artifact_ref: Option<ArtifactRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<BuildError>,
    estimated_duration_secs: u64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl BuildResponse {
    fn from_build(build: Build, log_lines: usize) -> Self {
        let logs = build.recent_logs(log_lines).to_vec();
        Self {
            build_id: build.id,
            status: build.status,
            progress: build.progress,
            stage: build.stage,
            logs,
            artifact_ref: build.artifact,
            error: build.error,
            estimated_duration_secs: build.estimated_duration_secs,
            created_at: build.created_at,
            updated_at: build.updated_at,
        }
    }
}

async fn get_build(
    State(state): State<AppState>,
    Path(id): Path<BuildId>,
    Query(query): Query<GetBuildQuery>,
) -> Result<Json<BuildResponse>, ApiError> {
    let build = state.builds.poll(id).await?;
    let lines = query.logs.unwrap_or(DEFAULT_LOG_LINES);
    Ok(Json(BuildResponse::from_build(build, lines)))
}

#[derive(Debug, Deserialize)]
struct ListBuildsQuery {
    requester: Option<String>,
}

#[derive(Debug, Serialize)]
struct BuildSummary {
    build_id: BuildId,
    status: BuildStatus,
    progress: u8,
    stage: String,
    requester: String,
    image_name: String,
    created_at: DateTime<Utc>,
}

async fn list_builds(
    State(state): State<AppState>,
    Query(query): Query<ListBuildsQuery>,
) -> Result<Json<Vec<BuildSummary>>, ApiError> {
    let builds = state.builds.list(query.requester.as_deref()).await?;
    let response = builds
        .into_iter()
        .map(|b| BuildSummary {
            build_id: b.id,
            status: b.status,
            progress: b.progress,
            stage: b.stage,
            requester: b.config.requester,
            image_name: b.config.image_name,
            created_at: b.created_at,
        })
        .collect();
    Ok(Json(response))
}

async fn download_build(
    State(state): State<AppState>,
    Path(id): Path<BuildId>,
) -> Result<Json<DownloadGrant>, ApiError> {
    Ok(Json(state.builds.download(id).await?))
}

#[derive(Debug, Serialize)]
struct CancelResponse {
    build_id: BuildId,
    status: BuildStatus,
}

async fn cancel_build(
    State(state): State<AppState>,
    Path(id): Path<BuildId>,
) -> Result<Json<CancelResponse>, ApiError> {
    let build = state.builds.cancel(id).await?;
    Ok(Json(CancelResponse {
        build_id: build.id,
        status: build.status,
    }))
}
