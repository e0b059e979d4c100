//! Admin client operations used by the CLI

use crate::authority::ChunkInfo;
use crate::common::{ChunkRange, Error, Result};
use crate::coordinator::engine::MigrationOutcome;
use crate::coordinator::rpc::{decode_response, http_client};
use crate::coordinator::status::MigrationStatus;
use crate::coordinator::MigrationRequest;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use uuid::Uuid;

// Migrations can take a while; the admin call waits for the outcome
const ADMIN_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Deserialize)]
struct CurrentOpResponse {
    inprog: Vec<MigrationStatus>,
}

#[derive(Debug, Deserialize)]
struct CountResponse {
    count: u64,
}

/// Version the authority currently records for exactly `range`
pub async fn chunk_version(authority_url: &str, namespace: &str, range: ChunkRange) -> Result<u64> {
    let client = http_client(ADMIN_TIMEOUT)?;
    let resp = client
        .get(format!(
            "{}/collections/{}/chunks",
            authority_url.trim_end_matches('/'),
            namespace
        ))
        .send()
        .await?;
    let chunks: Vec<ChunkInfo> = decode_response(resp).await?;
    chunks
        .into_iter()
        .find(|c| c.range == range)
        .map(|c| c.version)
        .ok_or_else(|| Error::NotFound(format!("no chunk {} in {}", range, namespace)))
}

pub async fn move_chunk(coordinator_url: &str, request: &MigrationRequest) -> Result<MigrationOutcome> {
    tracing::info!(namespace = %request.namespace, range = %request.range, "requesting moveChunk");
    let client = http_client(ADMIN_TIMEOUT)?;
    let resp = client
        .post(format!("{}/admin/moveChunk", coordinator_url.trim_end_matches('/')))
        .json(request)
        .send()
        .await?;
    decode_response(resp).await
}

pub async fn forget_migration(coordinator_url: &str, migration_id: Uuid) -> Result<()> {
    let client = http_client(ADMIN_TIMEOUT)?;
    let resp = client
        .post(format!(
            "{}/admin/forgetMigration",
            coordinator_url.trim_end_matches('/')
        ))
        .json(&json!({ "migrationId": migration_id }))
        .send()
        .await?;
    decode_response::<serde_json::Value>(resp).await.map(|_| ())
}

pub async fn current_op(coordinator_url: &str) -> Result<Vec<MigrationStatus>> {
    let client = http_client(ADMIN_TIMEOUT)?;
    let resp = client
        .get(format!("{}/admin/currentOp", coordinator_url.trim_end_matches('/')))
        .send()
        .await?;
    let body: CurrentOpResponse = decode_response(resp).await?;
    Ok(body.inprog)
}

/// Documents of `namespace` on one shard, optionally limited to a range
pub async fn count_documents(
    shard_url: &str,
    namespace: &str,
    range: Option<ChunkRange>,
) -> Result<u64> {
    let client = http_client(ADMIN_TIMEOUT)?;
    let mut request = client.get(format!(
        "{}/collections/{}/count",
        shard_url.trim_end_matches('/'),
        namespace
    ));
    if let Some(range) = range {
        request = request.query(&[("min", range.min), ("max", range.max)]);
    }
    let body: CountResponse = decode_response(request.send().await?).await?;
    Ok(body.count)
}
