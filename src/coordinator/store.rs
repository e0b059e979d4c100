//! Coordinator document store
//!
//! Durable, keyed-by-migration-id persistence for one record per in-flight
//! migration. Record format: `[CRC32:4][bincode document]`.
//!
//! The store enforces the document invariants (range exclusivity, write-once
//! decision, delete only after cleanup) but makes no protocol decisions.

use crate::common::{timestamp_now_millis, ChunkRange, Error, Result};
use crate::coordinator::backend::DocumentBackend;
use crate::coordinator::document::{Decision, MigrationCoordinatorDocument};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// A record found by a scan
#[derive(Debug, Clone)]
pub enum ScannedDocument {
    Valid(MigrationCoordinatorDocument),
    /// Unreadable or invariant-violating record; needs an operator.
    /// `claim` is the namespace and range when the record still parses.
    Corrupt {
        key: String,
        reason: String,
        claim: Option<(String, ChunkRange)>,
    },
}

pub struct CoordinatorStore {
    backend: Arc<dyn DocumentBackend>,
    // Serializes read-check-write sequences (range exclusivity, write-once decision)
    write_lock: Mutex<()>,
}

impl CoordinatorStore {
    pub fn new(backend: Arc<dyn DocumentBackend>) -> Self {
        Self {
            backend,
            write_lock: Mutex::new(()),
        }
    }

    fn encode(doc: &MigrationCoordinatorDocument) -> Result<Vec<u8>> {
        let body = bincode::serialize(doc)?;
        let mut record = Vec::with_capacity(body.len() + 4);
        record.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
        record.extend_from_slice(&body);
        Ok(record)
    }

    fn corrupt(key: &str, reason: String) -> Error {
        Error::CorruptState {
            migration_id: key.to_string(),
            reason,
        }
    }

    /// Checksum and deserialize, without checking document invariants
    fn parse(key: &str, record: &[u8]) -> Result<MigrationCoordinatorDocument> {
        if record.len() < 4 {
            return Err(Self::corrupt(key, "truncated record".into()));
        }
        let (crc_bytes, body) = record.split_at(4);
        let stored = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
        let computed = crc32fast::hash(body);
        if stored != computed {
            return Err(Self::corrupt(
                key,
                format!("checksum mismatch: expected {:08x}, got {:08x}", stored, computed),
            ));
        }
        bincode::deserialize(body).map_err(|e| Self::corrupt(key, e.to_string()))
    }

    fn check(key: &str, doc: &MigrationCoordinatorDocument) -> Result<()> {
        if doc.migration_id.to_string() != key {
            return Err(Self::corrupt(
                key,
                format!("record key does not match migration id {}", doc.migration_id),
            ));
        }
        doc.validate()
    }

    fn decode(key: &str, record: &[u8]) -> Result<MigrationCoordinatorDocument> {
        let doc = Self::parse(key, record)?;
        Self::check(key, &doc)?;
        Ok(doc)
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn put(&self, doc: &MigrationCoordinatorDocument) -> Result<()> {
        let key = doc.migration_id.to_string();
        self.backend.put(key.as_bytes(), &Self::encode(doc)?)
    }

    /// Insert a new document. Fails with `Conflict` if an active document
    /// already covers an overlapping range of the same namespace.
    pub fn create(&self, doc: &MigrationCoordinatorDocument) -> Result<()> {
        doc.validate()?;
        if doc.decision.is_terminal() {
            return Err(Error::InvariantViolation(
                "coordinator documents are created pending".into(),
            ));
        }
        let _guard = self.guard();
        for scanned in self.scan_unlocked()? {
            match scanned {
                ScannedDocument::Valid(existing) => {
                    if existing.migration_id == doc.migration_id
                        || (existing.namespace == doc.namespace
                            && existing.range.overlaps(&doc.range))
                    {
                        return Err(Error::Conflict {
                            namespace: doc.namespace.clone(),
                            range: doc.range.to_string(),
                            existing: existing.migration_id.to_string(),
                        });
                    }
                }
                // A record whose range cannot be read may cover anything
                ScannedDocument::Corrupt { key, reason, claim } => {
                    let blocks = match &claim {
                        Some((namespace, range)) => {
                            *namespace == doc.namespace && range.overlaps(&doc.range)
                        }
                        None => true,
                    };
                    if blocks || key == doc.migration_id.to_string() {
                        return Err(Error::CorruptState {
                            migration_id: key,
                            reason: format!("blocks {} {}: {}", doc.namespace, doc.range, reason),
                        });
                    }
                }
            }
        }
        self.put(doc)?;
        tracing::debug!(migration_id = %doc.migration_id, ns = %doc.namespace, range = %doc.range, "created coordinator document");
        Ok(())
    }

    /// Load a document; `None` means it was never created or already deleted
    pub fn get(&self, id: Uuid) -> Result<Option<MigrationCoordinatorDocument>> {
        let key = id.to_string();
        match self.backend.get(key.as_bytes())? {
            Some(record) => Ok(Some(Self::decode(&key, &record)?)),
            None => Ok(None),
        }
    }

    fn get_existing(&self, id: Uuid) -> Result<MigrationCoordinatorDocument> {
        self.get(id)?
            .ok_or_else(|| Error::NotFound(format!("migration coordinator {}", id)))
    }

    /// Write the decision, at most once. Replaying the same decision returns
    /// the stored document unchanged; a different decision is refused.
    pub fn set_decision(
        &self,
        id: Uuid,
        decision: Decision,
        abort_reason: Option<String>,
    ) -> Result<MigrationCoordinatorDocument> {
        if !decision.is_terminal() {
            return Err(Error::InvariantViolation(
                "decision can only move to commit or abort".into(),
            ));
        }
        let _guard = self.guard();
        let mut doc = self.get_existing(id)?;
        if doc.decision == decision {
            return Ok(doc);
        }
        if doc.decision.is_terminal() {
            return Err(Error::DecisionConflict {
                migration_id: id.to_string(),
                existing: doc.decision.to_string(),
                attempted: decision.to_string(),
            });
        }
        doc.decision = decision;
        doc.decision_timestamp = Some(timestamp_now_millis());
        doc.abort_reason = match decision {
            Decision::Abort => Some(abort_reason.unwrap_or_else(|| "aborted".to_string())),
            _ => None,
        };
        self.put(&doc)?;
        Ok(doc)
    }

    /// Record that the losing side has deleted its copy of the range
    pub fn mark_cleanup_confirmed(&self, id: Uuid) -> Result<MigrationCoordinatorDocument> {
        let _guard = self.guard();
        let mut doc = self.get_existing(id)?;
        if !doc.decision.is_terminal() {
            return Err(Error::InvariantViolation(format!(
                "cleanup of migration {} confirmed before a decision",
                id
            )));
        }
        if !doc.cleanup_confirmed {
            doc.cleanup_confirmed = true;
            self.put(&doc)?;
        }
        Ok(doc)
    }

    /// Delete a decided and cleaned-up document. Returns `false` if it was
    /// already gone.
    pub fn delete(&self, id: Uuid) -> Result<bool> {
        let _guard = self.guard();
        let Some(doc) = self.get(id)? else {
            return Ok(false);
        };
        if !doc.is_forgettable() {
            return Err(Error::InvariantViolation(format!(
                "migration {} cannot be deleted: decision {}, cleanup confirmed {}",
                id, doc.decision, doc.cleanup_confirmed
            )));
        }
        self.backend.delete(id.to_string().as_bytes())?;
        self.backend.flush()?;
        Ok(true)
    }

    fn scan_unlocked(&self) -> Result<Vec<ScannedDocument>> {
        let mut docs = Vec::new();
        for (key_bytes, record) in self.backend.scan()? {
            let key = String::from_utf8_lossy(&key_bytes).into_owned();
            let scanned = match Self::parse(&key, &record) {
                Ok(doc) => match Self::check(&key, &doc) {
                    Ok(()) => ScannedDocument::Valid(doc),
                    Err(e) => ScannedDocument::Corrupt {
                        key,
                        reason: e.to_string(),
                        claim: Some((doc.namespace, doc.range)),
                    },
                },
                Err(e) => ScannedDocument::Corrupt {
                    key,
                    reason: e.to_string(),
                    claim: None,
                },
            };
            docs.push(scanned);
        }
        Ok(docs)
    }

    /// All non-deleted documents, for recovery
    pub fn scan_active(&self) -> Result<Vec<ScannedDocument>> {
        self.scan_unlocked()
    }

    /// Active documents of one namespace that overlap `range`
    pub fn find_overlapping(
        &self,
        namespace: &str,
        range: &ChunkRange,
    ) -> Result<Vec<MigrationCoordinatorDocument>> {
        Ok(self
            .scan_unlocked()?
            .into_iter()
            .filter_map(|s| match s {
                ScannedDocument::Valid(doc)
                    if doc.namespace == namespace && doc.range.overlaps(range) =>
                {
                    Some(doc)
                }
                _ => None,
            })
            .collect())
    }

    /// Number of stored documents, corrupt ones included
    pub fn count(&self) -> Result<usize> {
        Ok(self.backend.scan()?.len())
    }
}
