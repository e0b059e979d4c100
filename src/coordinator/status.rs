//! Status reporter: read-only currentOp-style projection of live migrations
//!
//! Field names and the numeric `lastDurableState` values are an external
//! contract; consumers compare them verbatim.

use crate::common::timestamp_now_millis;
use crate::coordinator::document::{Decision, MigrationCoordinatorDocument};
use crate::coordinator::engine::MigrationPhase;
use crate::coordinator::instance::InstanceRegistry;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub const STATUS_DESC: &str = "chunk migration coordinator";

/// Externally visible migration state, ordered
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum DurableState {
    Uninitialized = 0,
    DataSync = 1,
    Blocking = 2,
    Committed = 3,
    Aborted = 4,
}

impl DurableState {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(DurableState::Uninitialized),
            1 => Some(DurableState::DataSync),
            2 => Some(DurableState::Blocking),
            3 => Some(DurableState::Committed),
            4 => Some(DurableState::Aborted),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            DurableState::Uninitialized => "uninitialized",
            DurableState::DataSync => "data-sync",
            DurableState::Blocking => "blocking",
            DurableState::Committed => "committed",
            DurableState::Aborted => "aborted",
        }
    }
}

impl Serialize for DurableState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

impl<'de> Deserialize<'de> for DurableState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = u8::deserialize(deserializer)?;
        DurableState::from_code(code)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown durable state {}", code)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationStatus {
    pub desc: String,
    pub migration_id: Uuid,
    pub namespace: String,
    pub range_min: i64,
    pub range_max: i64,
    pub donor_shard: String,
    pub recipient_shard: String,
    pub last_durable_state: DurableState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_timestamp: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_or_abort_op_time: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
    pub migration_completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire_at: Option<u64>,
}

impl MigrationStatus {
    pub fn from_document(doc: &MigrationCoordinatorDocument) -> Self {
        let mut status = Self {
            desc: STATUS_DESC.to_string(),
            migration_id: doc.migration_id,
            namespace: doc.namespace.clone(),
            range_min: doc.range.min,
            range_max: doc.range.max,
            donor_shard: doc.donor_shard.clone(),
            recipient_shard: doc.recipient_shard.clone(),
            last_durable_state: DurableState::Uninitialized,
            block_timestamp: None,
            commit_or_abort_op_time: None,
            abort_reason: None,
            migration_completed: false,
            expire_at: None,
        };
        status.apply_decision(doc);
        status
    }

    /// Fold a phase change into the projection
    pub fn apply_phase(&mut self, phase: MigrationPhase) {
        match phase {
            MigrationPhase::Created | MigrationPhase::DataCopied => {
                if self.last_durable_state < DurableState::DataSync {
                    self.last_durable_state = DurableState::DataSync;
                }
            }
            MigrationPhase::AwaitingMetadataCommit => {
                self.last_durable_state = DurableState::Blocking;
                self.block_timestamp.get_or_insert_with(timestamp_now_millis);
            }
            _ => {}
        }
    }

    /// Fold a (possibly decided) persisted document into the projection
    pub fn apply_decision(&mut self, doc: &MigrationCoordinatorDocument) {
        match doc.decision {
            Decision::Pending => {}
            Decision::Commit => {
                self.last_durable_state = DurableState::Committed;
                self.commit_or_abort_op_time = doc.decision_timestamp;
            }
            Decision::Abort => {
                self.last_durable_state = DurableState::Aborted;
                self.commit_or_abort_op_time = doc.decision_timestamp;
                self.abort_reason = doc.abort_reason.clone();
            }
        }
    }

    /// The document is about to be deleted
    pub fn mark_completed(&mut self, retention: Duration) {
        self.migration_completed = true;
        self.expire_at = Some(timestamp_now_millis() + retention.as_millis() as u64);
    }

    pub fn decision(&self) -> Decision {
        match self.last_durable_state {
            DurableState::Committed => Decision::Commit,
            DurableState::Aborted => Decision::Abort,
            _ => Decision::Pending,
        }
    }
}

/// Read-only view over the live instances of one engine
#[derive(Clone)]
pub struct StatusReporter {
    registry: Arc<InstanceRegistry>,
}

impl StatusReporter {
    pub fn new(registry: Arc<InstanceRegistry>) -> Self {
        Self { registry }
    }

    /// In-progress and recently completed migrations, oldest first.
    /// Completed entries past their `expireAt` are dropped.
    pub fn current_op(&self) -> Vec<MigrationStatus> {
        self.registry.prune_expired(timestamp_now_millis());
        let mut statuses: Vec<_> = self.registry.all().iter().map(|i| i.status()).collect();
        statuses.sort_by_key(|s| (s.migration_completed, s.migration_id));
        statuses
    }

    pub fn get(&self, migration_id: Uuid) -> Option<MigrationStatus> {
        self.registry.get(migration_id).map(|i| i.status())
    }
}
