//! Chunk registry: the authoritative owner and version of every chunk
//!
//! Each sharded namespace is stored as one JSON record in a
//! [`DocumentBackend`], so an authority backed by RocksDB keeps its routing
//! table across restarts.

use crate::common::{ChunkRange, Error, Result};
use crate::coordinator::backend::DocumentBackend;
use crate::coordinator::rpc::{
    AbortChunkRequest, CommitChunkRequest, CommitOutcome, MetadataAuthority, MigrationStatusRequest,
    RecordedOutcome,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

/// Column family of the authority's RocksDB store
pub const CF_CHUNKS: &str = "chunks";

/// Fail point that makes every new commit come back as a version conflict
pub const COMMIT_VERSION_ERROR_FAILPOINT: &str = "migrationCommitVersionError";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkInfo {
    pub range: ChunkRange,
    pub owner: String,
    pub version: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CollectionChunks {
    /// Keyed by range min; ranges tile the key space
    chunks: BTreeMap<i64, ChunkInfo>,
    /// Applied commits: migration id -> version it produced
    committed: BTreeMap<Uuid, u64>,
    aborted: BTreeSet<Uuid>,
}

impl CollectionChunks {
    fn containing(&self, key: i64) -> Option<&ChunkInfo> {
        self.chunks
            .range(..=key)
            .next_back()
            .map(|(_, c)| c)
            .filter(|c| c.range.contains(key))
    }
}

pub struct ChunkRegistry {
    backend: Arc<dyn DocumentBackend>,
    collections: Mutex<BTreeMap<String, CollectionChunks>>,
    commit_version_error: AtomicBool,
    commit_calls: AtomicU64,
}

impl ChunkRegistry {
    /// Load every sharded collection found in `backend`
    pub fn open(backend: Arc<dyn DocumentBackend>) -> Result<Self> {
        let mut collections = BTreeMap::new();
        for (key, value) in backend.scan()? {
            let namespace = String::from_utf8_lossy(&key).into_owned();
            let chunks: CollectionChunks = serde_json::from_slice(&value)?;
            collections.insert(namespace, chunks);
        }
        tracing::info!(collections = collections.len(), "chunk registry loaded");
        Ok(Self {
            backend,
            collections: Mutex::new(collections),
            commit_version_error: AtomicBool::new(false),
            commit_calls: AtomicU64::new(0),
        })
    }

    fn collections(&self) -> MutexGuard<'_, BTreeMap<String, CollectionChunks>> {
        self.collections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn persist(&self, namespace: &str, chunks: &CollectionChunks) -> Result<()> {
        let value = serde_json::to_vec(chunks)?;
        self.backend.put(namespace.as_bytes(), &value)
    }

    /// Register `namespace` with a single chunk over the whole key space
    pub fn shard_collection(&self, namespace: &str, primary_shard: &str) -> Result<ChunkInfo> {
        if namespace.is_empty() || primary_shard.is_empty() {
            return Err(Error::InvalidDocument(
                "namespace and primary shard are required".into(),
            ));
        }
        let mut collections = self.collections();
        if let Some(existing) = collections.get(namespace) {
            return existing
                .chunks
                .values()
                .next()
                .filter(|_| existing.chunks.len() == 1)
                .filter(|c| c.owner == primary_shard)
                .cloned()
                .ok_or_else(|| Error::InvalidDocument(format!("{} is already sharded", namespace)));
        }
        let chunk = ChunkInfo {
            range: ChunkRange::full(),
            owner: primary_shard.to_string(),
            version: 1,
        };
        let mut entry = CollectionChunks::default();
        entry.chunks.insert(chunk.range.min, chunk.clone());
        self.persist(namespace, &entry)?;
        collections.insert(namespace.to_string(), entry);
        tracing::info!(namespace, primary_shard, "collection sharded");
        Ok(chunk)
    }

    /// Split the chunk containing `at` into `[min, at)` and `[at, max)`.
    /// Both halves get a new version.
    pub fn split_chunk(&self, namespace: &str, at: i64) -> Result<(ChunkInfo, ChunkInfo)> {
        let mut collections = self.collections();
        let current = collections
            .get(namespace)
            .ok_or_else(|| Error::NotFound(format!("collection {}", namespace)))?;
        let chunk = current
            .containing(at)
            .cloned()
            .ok_or_else(|| Error::InvalidRange(format!("no chunk contains {}", at)))?;
        let (low, high) = chunk.range.split_at(at)?;
        let low = ChunkInfo {
            range: low,
            owner: chunk.owner.clone(),
            version: chunk.version + 1,
        };
        let high = ChunkInfo {
            range: high,
            owner: chunk.owner,
            version: chunk.version + 1,
        };
        let mut next = current.clone();
        next.chunks.insert(low.range.min, low.clone());
        next.chunks.insert(high.range.min, high.clone());
        self.persist(namespace, &next)?;
        collections.insert(namespace.to_string(), next);
        Ok((low, high))
    }

    pub fn chunks(&self, namespace: &str) -> Result<Vec<ChunkInfo>> {
        self.collections()
            .get(namespace)
            .map(|c| c.chunks.values().cloned().collect())
            .ok_or_else(|| Error::NotFound(format!("collection {}", namespace)))
    }

    /// Chunk whose range is exactly `range`
    pub fn chunk(&self, namespace: &str, range: &ChunkRange) -> Result<ChunkInfo> {
        self.chunks(namespace)?
            .into_iter()
            .find(|c| c.range == *range)
            .ok_or_else(|| Error::NotFound(format!("no chunk {} in {}", range, namespace)))
    }

    pub fn owner_of(&self, namespace: &str, key: i64) -> Result<String> {
        let collections = self.collections();
        let entry = collections
            .get(namespace)
            .ok_or_else(|| Error::NotFound(format!("collection {}", namespace)))?;
        entry
            .containing(key)
            .map(|c| c.owner.clone())
            .ok_or_else(|| Error::NotFound(format!("no chunk contains {}", key)))
    }

    pub fn set_failpoint(&self, name: &str, enabled: bool) -> Result<()> {
        match name {
            COMMIT_VERSION_ERROR_FAILPOINT => {
                self.commit_version_error.store(enabled, Ordering::SeqCst);
                tracing::info!(failpoint = name, enabled, "fail point configured");
                Ok(())
            }
            other => Err(Error::NotFound(format!("fail point {}", other))),
        }
    }

    /// Number of commit requests received, replays included
    pub fn commit_calls(&self) -> u64 {
        self.commit_calls.load(Ordering::SeqCst)
    }

    pub fn was_committed(&self, namespace: &str, migration_id: Uuid) -> bool {
        self.collections()
            .get(namespace)
            .is_some_and(|c| c.committed.contains_key(&migration_id))
    }

    pub fn was_aborted(&self, namespace: &str, migration_id: Uuid) -> bool {
        self.collections()
            .get(namespace)
            .is_some_and(|c| c.aborted.contains(&migration_id))
    }

    fn commit(&self, request: &CommitChunkRequest) -> Result<CommitOutcome> {
        self.commit_calls.fetch_add(1, Ordering::SeqCst);
        let mut collections = self.collections();
        let current = collections
            .get(&request.namespace)
            .ok_or_else(|| Error::NotFound(format!("collection {}", request.namespace)))?;

        if let Some(&new_version) = current.committed.get(&request.migration_id) {
            return Ok(CommitOutcome::Committed { new_version });
        }
        let conflict = |reason: String| Ok(CommitOutcome::VersionConflict { reason });
        if current.aborted.contains(&request.migration_id) {
            return conflict(format!("migration {} was aborted", request.migration_id));
        }
        if self.commit_version_error.load(Ordering::SeqCst) {
            return conflict(format!("{} fail point is on", COMMIT_VERSION_ERROR_FAILPOINT));
        }
        let Some(chunk) = current.chunks.get(&request.range.min) else {
            return conflict(format!("no chunk starts at {}", request.range.min));
        };
        if chunk.range != request.range {
            return conflict(format!("chunk is {}, not {}", chunk.range, request.range));
        }
        if chunk.owner != request.donor_shard {
            return conflict(format!(
                "chunk is owned by {}, not {}",
                chunk.owner, request.donor_shard
            ));
        }
        if chunk.version != request.expected_version {
            return conflict(format!(
                "expected version {}, found {}",
                request.expected_version, chunk.version
            ));
        }

        let moved = ChunkInfo {
            range: chunk.range,
            owner: request.recipient_shard.clone(),
            version: chunk.version + 1,
        };
        let new_version = moved.version;
        let mut next = current.clone();
        next.chunks.insert(moved.range.min, moved);
        next.committed.insert(request.migration_id, new_version);
        self.persist(&request.namespace, &next)?;
        collections.insert(request.namespace.clone(), next);
        tracing::info!(
            migration_id = %request.migration_id,
            namespace = %request.namespace,
            range = %request.range,
            owner = %request.recipient_shard,
            new_version,
            "chunk ownership committed"
        );
        Ok(CommitOutcome::Committed { new_version })
    }

    fn abort(&self, request: &AbortChunkRequest) -> Result<()> {
        let mut collections = self.collections();
        let current = collections
            .get(&request.namespace)
            .ok_or_else(|| Error::NotFound(format!("collection {}", request.namespace)))?;
        if current.committed.contains_key(&request.migration_id) {
            tracing::error!(
                migration_id = %request.migration_id,
                range = %request.range,
                "abort requested for a committed migration"
            );
            return Err(Error::CorruptState {
                migration_id: request.migration_id.to_string(),
                reason: "abort requested after the commit was applied".into(),
            });
        }
        if current.aborted.contains(&request.migration_id) {
            return Ok(());
        }
        let mut next = current.clone();
        next.aborted.insert(request.migration_id);
        self.persist(&request.namespace, &next)?;
        collections.insert(request.namespace.clone(), next);
        tracing::info!(migration_id = %request.migration_id, range = %request.range, "migration aborted");
        Ok(())
    }

    fn status(&self, request: &MigrationStatusRequest) -> Result<RecordedOutcome> {
        let collections = self.collections();
        let entry = collections
            .get(&request.namespace)
            .ok_or_else(|| Error::NotFound(format!("collection {}", request.namespace)))?;
        if let Some(&new_version) = entry.committed.get(&request.migration_id) {
            return Ok(RecordedOutcome::Committed { new_version });
        }
        if entry.aborted.contains(&request.migration_id) {
            return Ok(RecordedOutcome::Aborted);
        }
        Ok(RecordedOutcome::Unknown)
    }
}

#[async_trait]
impl MetadataAuthority for ChunkRegistry {
    async fn commit_chunk(&self, request: &CommitChunkRequest) -> Result<CommitOutcome> {
        self.commit(request)
    }

    async fn abort_chunk(&self, request: &AbortChunkRequest) -> Result<()> {
        self.abort(request)
    }

    async fn migration_status(&self, request: &MigrationStatusRequest) -> Result<RecordedOutcome> {
        self.status(request)
    }
}
