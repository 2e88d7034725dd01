//! Sync endpoint routes.

use axum::{extract::State, routing::get, Json, Router};

use closet_engine::Clock;

use crate::auth::AuthUser;
use crate::error::Result;
use crate::handlers::{
    handle_list_items, handle_snapshot, handle_sync_all, handle_sync_items, ItemsResponse,
    SnapshotResponse, SyncAllResponse, SyncItemsRequest, SyncItemsResponse,
};
use crate::store::Collections;
use crate::AppState;

/// Create sync routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/sync/items", get(list_items_handler).post(sync_items_handler))
        .route("/sync/all", get(snapshot_handler).post(sync_all_handler))
}

/// GET /sync/items - The principal's items, newest first.
async fn list_items_handler(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<ItemsResponse>> {
    let response = handle_list_items(state.store.as_ref(), &auth.principal).await?;
    Ok(Json(response))
}

/// POST /sync/items - Upsert items on behalf of the principal.
async fn sync_items_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(request): Json<SyncItemsRequest>,
) -> Result<Json<SyncItemsResponse>> {
    let response = handle_sync_items(
        state.store.as_ref(),
        &auth.principal,
        request,
        state.clock.now_millis(),
    )
    .await?;
    Ok(Json(response))
}

/// GET /sync/all - Items plus every named collection.
async fn snapshot_handler(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<SnapshotResponse>> {
    let response = handle_snapshot(
        state.store.as_ref(),
        &auth.principal,
        state.clock.now_millis(),
    )
    .await?;
    Ok(Json(response))
}

/// POST /sync/all - Items plus named collections.
async fn sync_all_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(body): Json<Collections>,
) -> Result<Json<SyncAllResponse>> {
    let response = handle_sync_all(
        state.store.as_ref(),
        &auth.principal,
        body,
        state.clock.now_millis(),
    )
    .await?;
    Ok(Json(response))
}
