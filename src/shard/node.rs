//! A shard node: named collections, an oplog, and received decisions

use crate::common::{ChunkRange, Result, SequenceGenerator};
use crate::coordinator::document::Decision;
use crate::coordinator::rpc::DecisionNotice;
use crate::shard::collection::{Collection, IndexSpec, WriteMode};
use crate::shard::oplog::{apply_oplog, ApplyReport, OplogEntry, OplogOp};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

struct NodeState {
    collections: HashMap<String, Collection>,
    oplog: Vec<OplogEntry>,
    clock: SequenceGenerator,
    decisions: HashMap<Uuid, Decision>,
}

impl NodeState {
    fn log(&mut self, op: OplogOp) {
        let ts = self.clock.next_value();
        self.oplog.push(OplogEntry { ts, op });
    }
}

pub struct ShardNode {
    name: String,
    state: Mutex<NodeState>,
}

impl ShardNode {
    /// `clock` stamps oplog entries
    pub fn new(name: impl Into<String>, clock: SequenceGenerator) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(NodeState {
                collections: HashMap::new(),
                oplog: Vec::new(),
                clock,
                decisions: HashMap::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> MutexGuard<'_, NodeState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert(&self, namespace: &str, doc: Value) -> Result<()> {
        self.write_document(namespace, doc, WriteMode::Primary)
            .map(|_| ())
    }

    pub fn insert_many(&self, namespace: &str, docs: Vec<Value>) -> Result<u64> {
        let mut inserted = 0;
        for doc in docs {
            self.insert(namespace, doc)?;
            inserted += 1;
        }
        Ok(inserted)
    }

    /// Primary writes insert and are logged; replay writes upsert and are not
    pub fn write_document(&self, namespace: &str, doc: Value, mode: WriteMode) -> Result<u64> {
        let mut state = self.state();
        let coll = state.collections.entry(namespace.to_string()).or_default();
        let skipped = match mode {
            WriteMode::Primary => coll.insert(doc.clone(), mode)?,
            WriteMode::Replay => coll.upsert(doc.clone(), mode)?,
        };
        if mode == WriteMode::Primary {
            state.log(OplogOp::Insert {
                namespace: namespace.to_string(),
                document: doc,
            });
        }
        Ok(skipped)
    }

    /// Idempotent bulk upsert used by range cloning; unique indexes apply
    pub fn upsert_many(&self, namespace: &str, docs: Vec<Value>) -> Result<u64> {
        let mut state = self.state();
        let coll = state.collections.entry(namespace.to_string()).or_default();
        let mut written = 0;
        for doc in docs {
            coll.upsert(doc, WriteMode::Primary)?;
            written += 1;
        }
        Ok(written)
    }

    pub fn count(&self, namespace: &str) -> usize {
        self.state()
            .collections
            .get(namespace)
            .map(Collection::len)
            .unwrap_or(0)
    }

    pub fn count_in_range(&self, namespace: &str, range: &ChunkRange) -> usize {
        self.state()
            .collections
            .get(namespace)
            .map(|c| c.count_in_range(range))
            .unwrap_or(0)
    }

    pub fn fetch_range(&self, namespace: &str, range: &ChunkRange) -> Vec<Value> {
        self.state()
            .collections
            .get(namespace)
            .map(|c| c.fetch_range(range))
            .unwrap_or_default()
    }

    pub fn get(&self, namespace: &str, id: i64) -> Option<Value> {
        self.state()
            .collections
            .get(namespace)
            .and_then(|c| c.get(id).cloned())
    }

    pub fn delete_range(&self, namespace: &str, range: &ChunkRange) -> u64 {
        let mut state = self.state();
        let deleted = match state.collections.get_mut(namespace) {
            Some(coll) => coll.delete_range(range),
            None => 0,
        };
        if deleted > 0 {
            state.log(OplogOp::DeleteRange {
                namespace: namespace.to_string(),
                range: *range,
            });
        }
        deleted
    }

    pub fn create_index(&self, namespace: &str, spec: IndexSpec) -> Result<()> {
        self.build_index(namespace, spec, WriteMode::Primary)
            .map(|_| ())
    }

    pub fn build_index(&self, namespace: &str, spec: IndexSpec, mode: WriteMode) -> Result<u64> {
        let mut state = self.state();
        let coll = state.collections.entry(namespace.to_string()).or_default();
        let skipped = coll.create_index(spec.clone(), mode)?;
        if mode == WriteMode::Primary {
            state.log(OplogOp::CreateIndex {
                namespace: namespace.to_string(),
                index: spec,
            });
        }
        Ok(skipped)
    }

    pub fn drop_index(&self, namespace: &str, name: &str) -> bool {
        let mut state = self.state();
        let dropped = state
            .collections
            .get_mut(namespace)
            .is_some_and(|c| c.drop_index(name));
        if dropped {
            state.log(OplogOp::DropIndex {
                namespace: namespace.to_string(),
                name: name.to_string(),
            });
        }
        dropped
    }

    pub fn index_specs(&self, namespace: &str) -> Vec<IndexSpec> {
        self.state()
            .collections
            .get(namespace)
            .map(Collection::index_specs)
            .unwrap_or_default()
    }

    /// Remember a delivered decision. Redelivery is harmless.
    pub fn record_decision(&self, notice: &DecisionNotice) {
        let previous = self
            .state()
            .decisions
            .insert(notice.migration_id, notice.decision);
        if previous.is_none() {
            tracing::info!(
                shard = %self.name,
                migration_id = %notice.migration_id,
                decision = %notice.decision,
                "decision received"
            );
        }
    }

    pub fn decision(&self, migration_id: Uuid) -> Option<Decision> {
        self.state().decisions.get(&migration_id).copied()
    }

    pub fn oplog(&self) -> Vec<OplogEntry> {
        self.state().oplog.clone()
    }

    pub fn apply_oplog(&self, entries: &[OplogEntry]) -> Result<ApplyReport> {
        apply_oplog(self, entries)
    }
}
