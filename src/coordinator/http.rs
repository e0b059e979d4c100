//! Admin HTTP API of the migration coordinator

use crate::common::{Error, Result};
use crate::coordinator::document::MigrationRequest;
use crate::coordinator::service::MigrationCoordinator;
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

pub type AdminState = Arc<MigrationCoordinator>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForgetMigrationRequest {
    pub migration_id: Uuid,
}

pub fn admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/moveChunk", post(move_chunk))
        .route("/admin/startMigration", post(start_migration))
        .route("/admin/forgetMigration", post(forget_migration))
        .route("/admin/currentOp", get(current_op))
        .route("/admin/migrations/:id", get(migration_status))
        .route("/admin/stepDown", post(step_down))
        .route("/admin/stepUp", post(step_up))
        .route("/admin/status", get(admin_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn move_chunk(
    State(state): State<AdminState>,
    Json(request): Json<MigrationRequest>,
) -> Result<impl IntoResponse> {
    let outcome = state.move_chunk(request).await?;
    Ok(Json(outcome))
}

async fn start_migration(
    State(state): State<AdminState>,
    Json(request): Json<MigrationRequest>,
) -> Result<impl IntoResponse> {
    let id = state.start_migration(request).await?;
    Ok(Json(json!({ "migrationId": id })))
}

async fn forget_migration(
    State(state): State<AdminState>,
    Json(request): Json<ForgetMigrationRequest>,
) -> Result<impl IntoResponse> {
    state.forget_migration(request.migration_id).await?;
    Ok(Json(json!({ "ok": 1 })))
}

async fn current_op(State(state): State<AdminState>) -> impl IntoResponse {
    Json(json!({ "inprog": state.current_op() }))
}

async fn migration_status(
    State(state): State<AdminState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    state
        .status_of(id)
        .map(Json)
        .ok_or_else(|| Error::NotFound(format!("migration {}", id)))
}

async fn step_down(State(state): State<AdminState>) -> impl IntoResponse {
    state.step_down();
    Json(json!({ "ok": 1, "primary": false }))
}

async fn step_up(State(state): State<AdminState>) -> Result<impl IntoResponse> {
    let report = state.step_up().await?;
    Ok(Json(report))
}

async fn admin_status(State(state): State<AdminState>) -> impl IntoResponse {
    let active = state
        .current_op()
        .iter()
        .filter(|s| !s.migration_completed)
        .count();
    Json(json!({
        "primary": state.is_primary(),
        "activeMigrations": active,
        "version": crate::VERSION,
    }))
}
