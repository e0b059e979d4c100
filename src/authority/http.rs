//! Metadata authority HTTP API

use crate::authority::chunks::ChunkRegistry;
use crate::common::Result;
use crate::coordinator::rpc::{
    AbortChunkRequest, CommitChunkRequest, MetadataAuthority, MigrationStatusRequest,
};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub type AuthorityState = Arc<ChunkRegistry>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardCollectionRequest {
    pub namespace: String,
    pub primary_shard: String,
}

#[derive(Debug, Deserialize)]
pub struct SplitChunkRequest {
    pub namespace: String,
    pub at: i64,
}

#[derive(Debug, Deserialize)]
pub struct FailPointRequest {
    /// `alwaysOn` or `off`
    pub mode: String,
}

pub fn authority_router(state: AuthorityState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/collections/shard", post(shard_collection))
        .route("/collections/split", post(split_chunk))
        .route("/collections/:ns/chunks", get(list_chunks))
        .route("/collections/:ns/owner/:key", get(owner_of))
        .route("/chunks/commit", post(commit_chunk))
        .route("/chunks/abort", post(abort_chunk))
        .route("/chunks/migrationStatus", post(migration_status))
        .route("/failpoints/:name", post(set_failpoint))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn shard_collection(
    State(state): State<AuthorityState>,
    Json(request): Json<ShardCollectionRequest>,
) -> Result<impl IntoResponse> {
    let chunk = state.shard_collection(&request.namespace, &request.primary_shard)?;
    Ok(Json(chunk))
}

async fn split_chunk(
    State(state): State<AuthorityState>,
    Json(request): Json<SplitChunkRequest>,
) -> Result<impl IntoResponse> {
    let (low, high) = state.split_chunk(&request.namespace, request.at)?;
    Ok(Json(vec![low, high]))
}

async fn list_chunks(
    State(state): State<AuthorityState>,
    Path(ns): Path<String>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.chunks(&ns)?))
}

async fn owner_of(
    State(state): State<AuthorityState>,
    Path((ns, key)): Path<(String, i64)>,
) -> Result<impl IntoResponse> {
    let owner = state.owner_of(&ns, key)?;
    Ok(Json(json!({ "namespace": ns, "key": key, "owner": owner })))
}

async fn commit_chunk(
    State(state): State<AuthorityState>,
    Json(request): Json<CommitChunkRequest>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.commit_chunk(&request).await?))
}

async fn abort_chunk(
    State(state): State<AuthorityState>,
    Json(request): Json<AbortChunkRequest>,
) -> Result<impl IntoResponse> {
    state.abort_chunk(&request).await?;
    Ok(Json(json!({ "ok": 1 })))
}

async fn migration_status(
    State(state): State<AuthorityState>,
    Json(request): Json<MigrationStatusRequest>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.migration_status(&request).await?))
}

async fn set_failpoint(
    State(state): State<AuthorityState>,
    Path(name): Path<String>,
    Json(request): Json<FailPointRequest>,
) -> Result<impl IntoResponse> {
    let enabled = match request.mode.as_str() {
        "alwaysOn" => true,
        "off" => false,
        other => {
            return Err(crate::Error::InvalidDocument(format!(
                "unknown fail point mode {}",
                other
            )))
        }
    };
    state.set_failpoint(&name, enabled)?;
    Ok(Json(json!({ "ok": 1, "name": name, "enabled": enabled })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::backend::MemBackend;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn app() -> Router {
        let registry = ChunkRegistry::open(Arc::new(MemBackend::new())).unwrap();
        authority_router(Arc::new(registry))
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_shard_then_query_owner() {
        let app = app();
        let resp = app
            .clone()
            .oneshot(post_json(
                "/collections/shard",
                json!({"namespace": "db.c", "primaryShard": "shard0"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/collections/db.c/owner/42")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["owner"], "shard0");
    }

    #[tokio::test]
    async fn test_unknown_failpoint_mode_rejected() {
        let resp = app()
            .oneshot(post_json(
                "/failpoints/migrationCommitVersionError",
                json!({"mode": "sometimes"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_migration_status_route() {
        let app = app();
        app.clone()
            .oneshot(post_json(
                "/collections/shard",
                json!({"namespace": "db.c", "primaryShard": "shard0"}),
            ))
            .await
            .unwrap();
        let resp = app
            .oneshot(post_json(
                "/chunks/migrationStatus",
                json!({"migrationId": "00000000-0000-0000-0000-000000000001", "namespace": "db.c"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], "unknown");
    }
}
