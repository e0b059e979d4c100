//! The migration coordinator document, the sole durable record of a migration

use crate::common::{timestamp_now_millis, ChunkRange, Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Outcome of a migration. Written once, never changed afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Pending,
    Commit,
    Abort,
}

impl Decision {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Decision::Pending)
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Pending => write!(f, "pending"),
            Decision::Commit => write!(f, "commit"),
            Decision::Abort => write!(f, "abort"),
        }
    }
}

/// What a caller asks for when starting a migration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationRequest {
    pub namespace: String,
    pub range: ChunkRange,
    pub donor_shard: String,
    pub recipient_shard: String,
    /// Chunk version the donor believes is current; the metadata commit is
    /// conditional on it.
    pub expected_version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationCoordinatorDocument {
    pub migration_id: Uuid,
    pub namespace: String,
    pub range: ChunkRange,
    pub donor_shard: String,
    pub recipient_shard: String,
    pub collection_version: u64,
    pub decision: Decision,
    pub decision_timestamp: Option<u64>,
    pub abort_reason: Option<String>,
    pub cleanup_confirmed: bool,
    pub created_at: u64,
}

impl MigrationCoordinatorDocument {
    pub fn new(request: MigrationRequest) -> Self {
        Self {
            migration_id: Uuid::new_v4(),
            namespace: request.namespace,
            range: request.range,
            donor_shard: request.donor_shard,
            recipient_shard: request.recipient_shard,
            collection_version: request.expected_version,
            decision: Decision::Pending,
            decision_timestamp: None,
            abort_reason: None,
            cleanup_confirmed: false,
            created_at: timestamp_now_millis(),
        }
    }

    /// Check every invariant a persisted document must satisfy
    pub fn validate(&self) -> Result<()> {
        let corrupt = |reason: &str| Error::CorruptState {
            migration_id: self.migration_id.to_string(),
            reason: reason.to_string(),
        };

        if self.namespace.is_empty() {
            return Err(corrupt("empty namespace"));
        }
        if self.donor_shard.is_empty() || self.recipient_shard.is_empty() {
            return Err(corrupt("missing participant"));
        }
        if self.donor_shard == self.recipient_shard {
            return Err(corrupt("donor and recipient are the same shard"));
        }
        if self.range.validate().is_err() {
            return Err(corrupt("invalid chunk range"));
        }
        match self.decision {
            Decision::Pending => {
                if self.decision_timestamp.is_some() {
                    return Err(corrupt("pending decision carries a timestamp"));
                }
                if self.abort_reason.is_some() {
                    return Err(corrupt("pending decision carries an abort reason"));
                }
                if self.cleanup_confirmed {
                    return Err(corrupt("cleanup confirmed before a decision"));
                }
            }
            Decision::Commit => {
                if self.decision_timestamp.is_none() {
                    return Err(corrupt("commit decision without timestamp"));
                }
                if self.abort_reason.is_some() {
                    return Err(corrupt("commit decision carries an abort reason"));
                }
            }
            Decision::Abort => {
                if self.decision_timestamp.is_none() {
                    return Err(corrupt("abort decision without timestamp"));
                }
            }
        }
        Ok(())
    }

    /// Shard that must not keep the range once the decision is known
    pub fn losing_shard(&self) -> Option<&str> {
        match self.decision {
            Decision::Pending => None,
            Decision::Commit => Some(&self.donor_shard),
            Decision::Abort => Some(&self.recipient_shard),
        }
    }

    /// Shard that owns the range once the decision is known
    pub fn owning_shard(&self) -> Option<&str> {
        match self.decision {
            Decision::Pending => None,
            Decision::Commit => Some(&self.recipient_shard),
            Decision::Abort => Some(&self.donor_shard),
        }
    }

    /// Safe to delete: decided and the losing copy is gone
    pub fn is_forgettable(&self) -> bool {
        self.decision.is_terminal() && self.cleanup_confirmed
    }
}
