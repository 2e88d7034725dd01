//! Liveness endpoints.

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::store::ItemStore;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    /// Backing store, `memory` or `postgres`
    pub store: &'static str,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/", get(banner))
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        store: state.store.kind(),
    })
}

async fn banner() -> &'static str {
    "Closet Sync Server"
}
