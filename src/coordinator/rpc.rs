//! RPC contracts toward the metadata authority and the participant shards
//!
//! Transient failures come back as retryable `Error`s; the engine's retry
//! loop absorbs them. Deterministic outcomes (`VersionConflict`, failed
//! clone) are values, not errors.

use crate::common::{ChunkRange, Error, Result};
use crate::coordinator::document::Decision;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitChunkRequest {
    pub migration_id: Uuid,
    pub namespace: String,
    pub range: ChunkRange,
    pub donor_shard: String,
    pub recipient_shard: String,
    pub expected_version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum CommitOutcome {
    Committed { new_version: u64 },
    VersionConflict { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbortChunkRequest {
    pub migration_id: Uuid,
    pub namespace: String,
    pub range: ChunkRange,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationStatusRequest {
    pub migration_id: Uuid,
    pub namespace: String,
}

/// What the authority has on record for a migration id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum RecordedOutcome {
    Committed { new_version: u64 },
    Aborted,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloneRangeRequest {
    pub migration_id: Uuid,
    pub namespace: String,
    pub range: ChunkRange,
    pub donor_shard: String,
    pub recipient_shard: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum CloneOutcome {
    Cloned { documents: u64 },
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionNotice {
    pub migration_id: Uuid,
    pub namespace: String,
    pub range: ChunkRange,
    pub decision: Decision,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RangeRequest {
    pub namespace: String,
    pub range: ChunkRange,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchRangeResponse {
    pub documents: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteRangeResponse {
    pub deleted: u64,
}

/// Error body returned by every HTTP surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub error: String,
}

/// The service that records authoritative range ownership
#[async_trait]
pub trait MetadataAuthority: Send + Sync {
    /// Conditional ownership transfer. Replaying a commit the authority already
    /// applied for the same migration id returns `Committed`.
    async fn commit_chunk(&self, request: &CommitChunkRequest) -> Result<CommitOutcome>;

    /// Must fail rather than abort a migration whose commit was applied
    async fn abort_chunk(&self, request: &AbortChunkRequest) -> Result<()>;

    /// Read-only lookup of a migration's recorded commit or abort
    async fn migration_status(&self, request: &MigrationStatusRequest) -> Result<RecordedOutcome>;
}

/// Donor and recipient shards, addressed by name
#[async_trait]
pub trait ParticipantClient: Send + Sync {
    /// Ask the recipient to pull the range from the donor (idempotent)
    async fn clone_range(&self, request: &CloneRangeRequest) -> Result<CloneOutcome>;

    async fn deliver_decision(&self, shard: &str, notice: &DecisionNotice) -> Result<()>;

    /// Delete every document of `namespace` in `range`; an empty range succeeds
    async fn delete_range(&self, shard: &str, namespace: &str, range: ChunkRange) -> Result<u64>;
}

pub(crate) async fn decode_response<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp.json::<T>().await?);
    }
    let body = resp.json::<ErrorBody>().await.ok();
    let err = match body {
        Some(body) => Error::from_code(&body.code, body.error),
        None => Error::Http(format!("unexpected status {}", status)),
    };
    // An unexplained 5xx is treated like an unavailable peer
    if status.is_server_error() && matches!(err, Error::Http(_)) {
        return Err(Error::Transient(err.to_string()));
    }
    Err(err)
}

pub(crate) fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| Error::InvalidConfig(format!("http client: {}", e)))
}

/// HTTP client for the metadata authority
pub struct HttpMetadataClient {
    base_url: String,
    http: reqwest::Client,
}

impl HttpMetadataClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: http_client(timeout)?,
        })
    }
}

#[async_trait]
impl MetadataAuthority for HttpMetadataClient {
    async fn commit_chunk(&self, request: &CommitChunkRequest) -> Result<CommitOutcome> {
        let resp = self
            .http
            .post(format!("{}/chunks/commit", self.base_url))
            .json(request)
            .send()
            .await?;
        decode_response(resp).await
    }

    async fn abort_chunk(&self, request: &AbortChunkRequest) -> Result<()> {
        let resp = self
            .http
            .post(format!("{}/chunks/abort", self.base_url))
            .json(request)
            .send()
            .await?;
        decode_response::<serde_json::Value>(resp).await.map(|_| ())
    }

    async fn migration_status(&self, request: &MigrationStatusRequest) -> Result<RecordedOutcome> {
        let resp = self
            .http
            .post(format!("{}/chunks/migrationStatus", self.base_url))
            .json(request)
            .send()
            .await?;
        decode_response(resp).await
    }
}

/// HTTP client for participant shards
pub struct HttpParticipantClient {
    directory: HashMap<String, String>,
    http: reqwest::Client,
}

impl HttpParticipantClient {
    /// `directory` maps shard names to base URLs
    pub fn new(directory: HashMap<String, String>, timeout: Duration) -> Result<Self> {
        let directory = directory
            .into_iter()
            .map(|(name, url)| (name, url.trim_end_matches('/').to_string()))
            .collect();
        Ok(Self {
            directory,
            http: http_client(timeout)?,
        })
    }

    fn url(&self, shard: &str, path: &str) -> Result<String> {
        let base = self
            .directory
            .get(shard)
            .ok_or_else(|| Error::NotFound(format!("shard {} is not in the directory", shard)))?;
        Ok(format!("{}{}", base, path))
    }
}

#[async_trait]
impl ParticipantClient for HttpParticipantClient {
    async fn clone_range(&self, request: &CloneRangeRequest) -> Result<CloneOutcome> {
        let resp = self
            .http
            .post(self.url(&request.recipient_shard, "/migration/clone")?)
            .json(request)
            .send()
            .await?;
        decode_response(resp).await
    }

    async fn deliver_decision(&self, shard: &str, notice: &DecisionNotice) -> Result<()> {
        let resp = self
            .http
            .post(self.url(shard, "/migration/decision")?)
            .json(notice)
            .send()
            .await?;
        decode_response::<serde_json::Value>(resp).await.map(|_| ())
    }

    async fn delete_range(&self, shard: &str, namespace: &str, range: ChunkRange) -> Result<u64> {
        let resp = self
            .http
            .post(self.url(shard, "/ranges/delete")?)
            .json(&RangeRequest {
                namespace: namespace.to_string(),
                range,
            })
            .send()
            .await?;
        let body: DeleteRangeResponse = decode_response(resp).await?;
        Ok(body.deleted)
    }
}
