//! Operation log entries and replay
//!
//! Replay applies entries against whatever index catalog the node has now,
//! which may include indexes created after the entry was written. A unique
//! constraint that did not exist at the time must not fail the replay, so
//! violations are skipped and counted instead.

use crate::common::{ChunkRange, Result};
use crate::shard::collection::{IndexSpec, WriteMode};
use crate::shard::node::ShardNode;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum OplogOp {
    Insert { namespace: String, document: Value },
    CreateIndex { namespace: String, index: IndexSpec },
    DropIndex { namespace: String, name: String },
    DeleteRange { namespace: String, range: ChunkRange },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OplogEntry {
    pub ts: u64,
    #[serde(flatten)]
    pub op: OplogOp,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyReport {
    pub applied: u64,
    pub index_violations: u64,
}

/// Apply `entries` in order in replay mode
pub fn apply_oplog(node: &ShardNode, entries: &[OplogEntry]) -> Result<ApplyReport> {
    let mut report = ApplyReport::default();
    for entry in entries {
        let skipped = match &entry.op {
            OplogOp::Insert {
                namespace,
                document,
            } => node.write_document(namespace, document.clone(), WriteMode::Replay)?,
            OplogOp::CreateIndex { namespace, index } => {
                node.build_index(namespace, index.clone(), WriteMode::Replay)?
            }
            OplogOp::DropIndex { namespace, name } => {
                node.drop_index(namespace, name);
                0
            }
            OplogOp::DeleteRange { namespace, range } => {
                node.delete_range(namespace, range);
                0
            }
        };
        if skipped > 0 {
            tracing::warn!(
                shard = node.name(),
                ts = entry.ts,
                skipped,
                "ignoring unique index violation during replay"
            );
        }
        report.index_violations += skipped;
        report.applied += 1;
    }
    Ok(report)
}
