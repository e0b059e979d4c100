//! In-process participant transport over shard nodes in the same process

use crate::common::{ChunkRange, Error, Result};
use crate::coordinator::rpc::{CloneOutcome, CloneRangeRequest, DecisionNotice, ParticipantClient};
use crate::shard::node::ShardNode;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct LocalParticipants {
    nodes: HashMap<String, Arc<ShardNode>>,
}

impl LocalParticipants {
    pub fn new(nodes: impl IntoIterator<Item = Arc<ShardNode>>) -> Self {
        Self {
            nodes: nodes
                .into_iter()
                .map(|n| (n.name().to_string(), n))
                .collect(),
        }
    }

    pub fn node(&self, shard: &str) -> Result<&Arc<ShardNode>> {
        self.nodes
            .get(shard)
            .ok_or_else(|| Error::NotFound(format!("shard {}", shard)))
    }
}

/// Copy a range from `donor` into `recipient`. A unique index violation on
/// the recipient is a deterministic failure, not an error.
pub fn clone_between(
    donor: &ShardNode,
    recipient: &ShardNode,
    namespace: &str,
    range: &ChunkRange,
) -> CloneOutcome {
    let docs = donor.fetch_range(namespace, range);
    match recipient.upsert_many(namespace, docs) {
        Ok(documents) => CloneOutcome::Cloned { documents },
        Err(e) => CloneOutcome::Failed {
            reason: e.to_string(),
        },
    }
}

#[async_trait]
impl ParticipantClient for LocalParticipants {
    async fn clone_range(&self, request: &CloneRangeRequest) -> Result<CloneOutcome> {
        let donor = self.node(&request.donor_shard)?;
        let recipient = self.node(&request.recipient_shard)?;
        Ok(clone_between(
            donor,
            recipient,
            &request.namespace,
            &request.range,
        ))
    }

    async fn deliver_decision(&self, shard: &str, notice: &DecisionNotice) -> Result<()> {
        self.node(shard)?.record_decision(notice);
        Ok(())
    }

    async fn delete_range(&self, shard: &str, namespace: &str, range: ChunkRange) -> Result<u64> {
        Ok(self.node(shard)?.delete_range(namespace, &range))
    }
}
