//! API routes.

pub mod artifacts;
pub mod builds;
pub mod catalog;
pub mod channel;
pub mod health;

use crate::AppState;
use axum::Router;

/// Build the main API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", api_router())
        .nest("/channel/v1", channel::router())
        .nest("/artifacts", artifacts::router())
        .merge(health::router())
        .with_state(state)
}

fn api_router() -> Router<AppState> {
    Router::new()
        .nest("/builds", builds::router())
        .nest("/catalog", catalog::router())
}
