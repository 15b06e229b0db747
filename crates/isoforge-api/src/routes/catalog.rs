//! Catalog endpoint.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use isoforge_config::Catalog;

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(get_catalog))
}

/// The allow-list of services and models with their dependencies.
async fn get_catalog(State(state): State<AppState>) -> Json<Catalog> {
    Json(state.builds.catalog().clone())
}
