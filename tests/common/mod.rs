//! In-process cluster for integration tests: one metadata authority, a donor
//! and a recipient shard, and coordinators built over a shared document
//! backend so a "new primary" sees exactly what the old one persisted.

#![allow(dead_code)]

use async_trait::async_trait;
use chunkshift::authority::ChunkRegistry;
use chunkshift::common::{ChunkRange, Error, Result, RetryPolicy, SequenceGenerator};
use chunkshift::coordinator::backend::{DocumentBackend, MemBackend};
use chunkshift::coordinator::rpc::{
    CloneOutcome, CloneRangeRequest, DecisionNotice, ParticipantClient,
};
use chunkshift::coordinator::store::{CoordinatorStore, ScannedDocument};
use chunkshift::coordinator::{
    DecisionEngine, EngineSettings, FailPoints, MigrationCoordinator, MigrationObserver,
    MigrationRequest,
};
use chunkshift::shard::{LocalParticipants, ShardNode};
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub const DONOR: &str = "shard0";
pub const RECIPIENT: &str = "shard1";
/// Documents per half of the key space
pub const DOCS_PER_CHUNK: i64 = 50;

pub fn fast_settings() -> EngineSettings {
    EngineSettings {
        retry: RetryPolicy::immediate(),
        auto_forget: true,
        status_retention: Duration::from_secs(60),
    }
}

/// The chunk every test migrates: `[0, MAX)`
pub fn moved_range() -> ChunkRange {
    ChunkRange::new(0, i64::MAX).unwrap()
}

pub fn kept_range() -> ChunkRange {
    ChunkRange::new(i64::MIN, 0).unwrap()
}

pub struct Cluster {
    pub namespace: String,
    pub backend: Arc<dyn DocumentBackend>,
    pub authority: Arc<ChunkRegistry>,
    pub donor: Arc<ShardNode>,
    pub recipient: Arc<ShardNode>,
    pub participants: Arc<dyn ParticipantClient>,
    pub failpoints: Arc<FailPoints>,
}

impl Cluster {
    pub fn new(names: &mut SequenceGenerator) -> Self {
        Self::with_backend(names, Arc::new(MemBackend::new()))
    }

    /// Shard `db.<name>`, split at 0, and fill the donor with documents
    /// `-DOCS_PER_CHUNK..DOCS_PER_CHUNK`
    pub fn with_backend(names: &mut SequenceGenerator, backend: Arc<dyn DocumentBackend>) -> Self {
        let namespace = format!("db.{}", names.next_name());
        let authority = Arc::new(ChunkRegistry::open(Arc::new(MemBackend::new())).unwrap());
        authority.shard_collection(&namespace, DONOR).unwrap();
        authority.split_chunk(&namespace, 0).unwrap();

        let donor = Arc::new(ShardNode::new(DONOR, SequenceGenerator::new(DONOR)));
        let recipient = Arc::new(ShardNode::new(RECIPIENT, SequenceGenerator::new(RECIPIENT)));
        for id in -DOCS_PER_CHUNK..DOCS_PER_CHUNK {
            donor
                .insert(&namespace, json!({"_id": id, "v": id * 10}))
                .unwrap();
        }
        let participants: Arc<dyn ParticipantClient> =
            Arc::new(LocalParticipants::new([donor.clone(), recipient.clone()]));

        Self {
            namespace,
            backend,
            authority,
            donor,
            recipient,
            participants,
            failpoints: Arc::new(FailPoints::new()),
        }
    }

    pub fn with_participants(mut self, participants: Arc<dyn ParticipantClient>) -> Self {
        self.participants = participants;
        self
    }

    pub fn store(&self) -> CoordinatorStore {
        CoordinatorStore::new(self.backend.clone())
    }

    pub fn engine(&self, settings: EngineSettings) -> Arc<DecisionEngine> {
        let observer: Arc<dyn MigrationObserver> = self.failpoints.clone();
        Arc::new(DecisionEngine::new(
            Arc::new(self.store()),
            self.authority.clone(),
            self.participants.clone(),
            observer,
            settings,
        ))
    }

    /// A fresh coordinator over the shared backend, as after a failover
    pub fn coordinator(&self) -> Arc<MigrationCoordinator> {
        self.coordinator_with(fast_settings())
    }

    pub fn coordinator_with(&self, settings: EngineSettings) -> Arc<MigrationCoordinator> {
        Arc::new(MigrationCoordinator::new(self.engine(settings)))
    }

    pub fn request(&self) -> MigrationRequest {
        MigrationRequest {
            namespace: self.namespace.clone(),
            range: moved_range(),
            donor_shard: DONOR.into(),
            recipient_shard: RECIPIENT.into(),
            expected_version: 2,
        }
    }

    /// Ids of every valid document in the store
    pub fn stored_ids(&self) -> Vec<Uuid> {
        self.store()
            .scan_active()
            .unwrap()
            .into_iter()
            .filter_map(|s| match s {
                ScannedDocument::Valid(doc) => Some(doc.migration_id),
                ScannedDocument::Corrupt { .. } => None,
            })
            .collect()
    }

    pub fn owner(&self) -> String {
        self.authority.owner_of(&self.namespace, 0).unwrap()
    }

    /// Every document of the moved range lives on exactly the shard the
    /// authority names as owner; the kept range never moved.
    pub fn assert_conserved(&self) {
        let range = moved_range();
        let (owner, other) = if self.owner() == DONOR {
            (&self.donor, &self.recipient)
        } else {
            (&self.recipient, &self.donor)
        };
        let docs = owner.fetch_range(&self.namespace, &range);
        assert_eq!(docs.len() as i64, DOCS_PER_CHUNK, "owner {} lost documents", owner.name());
        for (i, doc) in docs.iter().enumerate() {
            assert_eq!(doc["_id"], json!(i as i64));
            assert_eq!(doc["v"], json!(i as i64 * 10));
        }
        assert_eq!(
            other.count_in_range(&self.namespace, &range),
            0,
            "{} still holds the range",
            other.name()
        );
        assert_eq!(
            self.donor.count_in_range(&self.namespace, &kept_range()) as i64,
            DOCS_PER_CHUNK
        );
        assert_eq!(
            self.recipient.count_in_range(&self.namespace, &kept_range()),
            0
        );
    }
}

/// Participant transport that fails the first calls with transient errors
pub struct FlakyParticipants {
    inner: Arc<dyn ParticipantClient>,
    failures_left: AtomicU32,
    pub calls: AtomicU32,
}

impl FlakyParticipants {
    pub fn new(inner: Arc<dyn ParticipantClient>, failures: u32) -> Self {
        Self {
            inner,
            failures_left: AtomicU32::new(failures),
            calls: AtomicU32::new(0),
        }
    }

    fn maybe_fail(&self, what: &str) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(Error::Transient(format!("{} unavailable", what)));
        }
        Ok(())
    }
}

#[async_trait]
impl ParticipantClient for FlakyParticipants {
    async fn clone_range(&self, request: &CloneRangeRequest) -> Result<CloneOutcome> {
        self.maybe_fail("cloneRange")?;
        self.inner.clone_range(request).await
    }

    async fn deliver_decision(&self, shard: &str, notice: &DecisionNotice) -> Result<()> {
        self.maybe_fail("deliverDecision")?;
        self.inner.deliver_decision(shard, notice).await
    }

    async fn delete_range(&self, shard: &str, namespace: &str, range: ChunkRange) -> Result<u64> {
        self.maybe_fail("deleteRange")?;
        self.inner.delete_range(shard, namespace, range).await
    }
}
