//! Shard HTTP API: participant RPCs and data access

use crate::common::{ChunkRange, Error, Result};
use crate::coordinator::rpc::{
    decode_response, CloneOutcome, CloneRangeRequest, DecisionNotice, DeleteRangeResponse,
    FetchRangeResponse, RangeRequest,
};
use crate::shard::collection::IndexSpec;
use crate::shard::node::ShardNode;
use crate::shard::oplog::OplogEntry;
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

#[derive(Clone)]
pub struct ShardState {
    pub node: Arc<ShardNode>,
    /// Base URLs of the other shards, used to pull ranges
    pub peers: Arc<HashMap<String, String>>,
    pub http: reqwest::Client,
}

impl ShardState {
    pub fn new(node: Arc<ShardNode>, peers: HashMap<String, String>, http: reqwest::Client) -> Self {
        let peers = peers
            .into_iter()
            .map(|(name, url)| (name, url.trim_end_matches('/').to_string()))
            .collect();
        Self {
            node,
            peers: Arc::new(peers),
            http,
        }
    }

    async fn fetch_from(&self, donor: &str, namespace: &str, range: ChunkRange) -> Result<Vec<Value>> {
        if donor == self.node.name() {
            return Ok(self.node.fetch_range(namespace, &range));
        }
        let base = self
            .peers
            .get(donor)
            .ok_or_else(|| Error::NotFound(format!("shard {} is not a known peer", donor)))?;
        let resp = self
            .http
            .post(format!("{}/ranges/fetch", base))
            .json(&RangeRequest {
                namespace: namespace.to_string(),
                range,
            })
            .send()
            .await?;
        let body: FetchRangeResponse = decode_response(resp).await?;
        Ok(body.documents)
    }
}

#[derive(Debug, Deserialize)]
pub struct CountQuery {
    pub min: Option<i64>,
    pub max: Option<i64>,
}

pub fn shard_router(state: ShardState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/migration/clone", post(clone_range))
        .route("/migration/decision", post(deliver_decision))
        .route("/migration/decision/:id", get(get_decision))
        .route("/ranges/fetch", post(fetch_range))
        .route("/ranges/delete", post(delete_range))
        .route("/collections/:ns/documents", post(insert_documents))
        .route("/collections/:ns/documents/:id", get(get_document))
        .route("/collections/:ns/count", get(count))
        .route("/collections/:ns/indexes", post(create_index).get(list_indexes))
        .route("/collections/:ns/indexes/:name", delete(drop_index))
        .route("/oplog", get(oplog))
        .route("/oplog/apply", post(apply_oplog))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<ShardState>) -> impl IntoResponse {
    Json(json!({ "status": "ok", "shard": state.node.name() }))
}

/// The recipient pulls the range from the donor
async fn clone_range(
    State(state): State<ShardState>,
    Json(request): Json<CloneRangeRequest>,
) -> Result<impl IntoResponse> {
    if request.recipient_shard != state.node.name() {
        return Err(Error::InvalidDocument(format!(
            "clone for {} sent to {}",
            request.recipient_shard,
            state.node.name()
        )));
    }
    let docs = state
        .fetch_from(&request.donor_shard, &request.namespace, request.range)
        .await?;
    let outcome = match state.node.upsert_many(&request.namespace, docs) {
        Ok(documents) => CloneOutcome::Cloned { documents },
        Err(e) => CloneOutcome::Failed {
            reason: e.to_string(),
        },
    };
    Ok(Json(outcome))
}

async fn deliver_decision(
    State(state): State<ShardState>,
    Json(notice): Json<DecisionNotice>,
) -> impl IntoResponse {
    state.node.record_decision(&notice);
    Json(json!({ "ok": 1 }))
}

async fn get_decision(
    State(state): State<ShardState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let decision = state
        .node
        .decision(id)
        .ok_or_else(|| Error::NotFound(format!("no decision for migration {}", id)))?;
    Ok(Json(json!({ "migrationId": id, "decision": decision })))
}

async fn fetch_range(
    State(state): State<ShardState>,
    Json(request): Json<RangeRequest>,
) -> Result<impl IntoResponse> {
    request.range.validate()?;
    Ok(Json(FetchRangeResponse {
        documents: state.node.fetch_range(&request.namespace, &request.range),
    }))
}

async fn delete_range(
    State(state): State<ShardState>,
    Json(request): Json<RangeRequest>,
) -> Result<impl IntoResponse> {
    request.range.validate()?;
    let deleted = state.node.delete_range(&request.namespace, &request.range);
    Ok(Json(DeleteRangeResponse { deleted }))
}

async fn insert_documents(
    State(state): State<ShardState>,
    Path(ns): Path<String>,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse> {
    let docs = match body {
        Value::Array(docs) => docs,
        doc => vec![doc],
    };
    let inserted = state.node.insert_many(&ns, docs)?;
    Ok(Json(json!({ "inserted": inserted })))
}

async fn get_document(
    State(state): State<ShardState>,
    Path((ns, id)): Path<(String, i64)>,
) -> Result<impl IntoResponse> {
    state
        .node
        .get(&ns, id)
        .map(Json)
        .ok_or_else(|| Error::NotFound(format!("{} _id {}", ns, id)))
}

async fn count(
    State(state): State<ShardState>,
    Path(ns): Path<String>,
    Query(query): Query<CountQuery>,
) -> Result<impl IntoResponse> {
    let count = match (query.min, query.max) {
        (None, None) => state.node.count(&ns),
        (min, max) => {
            let range = ChunkRange::new(min.unwrap_or(i64::MIN), max.unwrap_or(i64::MAX))?;
            state.node.count_in_range(&ns, &range)
        }
    };
    Ok(Json(json!({ "namespace": ns, "count": count })))
}

async fn create_index(
    State(state): State<ShardState>,
    Path(ns): Path<String>,
    Json(spec): Json<IndexSpec>,
) -> Result<impl IntoResponse> {
    state.node.create_index(&ns, spec)?;
    Ok(Json(json!({ "ok": 1 })))
}

async fn list_indexes(State(state): State<ShardState>, Path(ns): Path<String>) -> impl IntoResponse {
    Json(state.node.index_specs(&ns))
}

async fn drop_index(
    State(state): State<ShardState>,
    Path((ns, name)): Path<(String, String)>,
) -> Result<impl IntoResponse> {
    if !state.node.drop_index(&ns, &name) {
        return Err(Error::NotFound(format!("index {} on {}", name, ns)));
    }
    Ok(Json(json!({ "ok": 1 })))
}

async fn oplog(State(state): State<ShardState>) -> impl IntoResponse {
    Json(state.node.oplog())
}

async fn apply_oplog(
    State(state): State<ShardState>,
    Json(entries): Json<Vec<OplogEntry>>,
) -> Result<impl IntoResponse> {
    let report = state.node.apply_oplog(&entries)?;
    Ok(Json(report))
}
