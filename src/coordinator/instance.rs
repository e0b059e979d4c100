//! In-memory migration instances, rebuilt from documents after a restart

use crate::coordinator::document::MigrationCoordinatorDocument;
use crate::coordinator::engine::MigrationPhase;
use crate::coordinator::status::MigrationStatus;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

/// One migration known to this engine
pub struct MigrationInstance {
    id: Uuid,
    /// Held for the whole of one protocol step
    step: AsyncMutex<MigrationPhase>,
    status: Mutex<MigrationStatus>,
}

impl MigrationInstance {
    pub fn new(doc: &MigrationCoordinatorDocument, phase: MigrationPhase) -> Self {
        let mut status = MigrationStatus::from_document(doc);
        status.apply_phase(phase);
        Self {
            id: doc.migration_id,
            step: AsyncMutex::new(phase),
            status: Mutex::new(status),
        }
    }

    /// Instance for a document found on disk, positioned by its fields alone
    pub fn from_document(doc: &MigrationCoordinatorDocument) -> Self {
        Self::new(doc, MigrationPhase::from_document(Some(doc)))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn lock_step(&self) -> tokio::sync::MutexGuard<'_, MigrationPhase> {
        self.step.lock().await
    }

    /// Last phase reached, without waiting for a running step
    pub fn try_phase(&self) -> Option<MigrationPhase> {
        self.step.try_lock().ok().map(|p| *p)
    }

    fn status_guard(&self) -> MutexGuard<'_, MigrationStatus> {
        self.status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn status(&self) -> MigrationStatus {
        self.status_guard().clone()
    }

    pub fn record_phase(&self, phase: MigrationPhase) {
        self.status_guard().apply_phase(phase);
    }

    pub fn record_decision(&self, doc: &MigrationCoordinatorDocument) {
        self.status_guard().apply_decision(doc);
    }

    pub fn record_completed(&self, retention: Duration) {
        self.status_guard().mark_completed(retention);
    }
}

/// Every instance owned by one engine. Nothing here survives a restart.
#[derive(Default)]
pub struct InstanceRegistry {
    instances: Mutex<HashMap<Uuid, Arc<MigrationInstance>>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> MutexGuard<'_, HashMap<Uuid, Arc<MigrationInstance>>> {
        self.instances
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<MigrationInstance>> {
        self.map().get(&id).cloned()
    }

    /// Insert unless an instance with the same id is already registered;
    /// either way return the registered one.
    pub fn get_or_insert(&self, instance: MigrationInstance) -> Arc<MigrationInstance> {
        self.map()
            .entry(instance.id())
            .or_insert_with(|| Arc::new(instance))
            .clone()
    }

    pub fn all(&self) -> Vec<Arc<MigrationInstance>> {
        self.map().values().cloned().collect()
    }

    /// Drop completed instances whose retention window has passed
    pub fn prune_expired(&self, now_millis: u64) -> usize {
        let mut map = self.map();
        let before = map.len();
        map.retain(|_, instance| {
            let status = instance.status();
            !(status.migration_completed && status.expire_at.is_some_and(|at| at <= now_millis))
        });
        before - map.len()
    }

    /// Forget every instance that has not completed; returns how many.
    /// An instance with a step still in flight is kept, so a later stepper
    /// waits on the same lock instead of running beside it.
    pub fn clear_active(&self) -> usize {
        let mut map = self.map();
        let before = map.len();
        map.retain(|_, instance| {
            instance.status().migration_completed || instance.try_phase().is_none()
        });
        before - map.len()
    }

    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ChunkRange;
    use crate::coordinator::document::MigrationRequest;

    fn doc() -> MigrationCoordinatorDocument {
        MigrationCoordinatorDocument::new(MigrationRequest {
            namespace: "test.ns".into(),
            range: ChunkRange::new(0, 10).unwrap(),
            donor_shard: "shard0".into(),
            recipient_shard: "shard1".into(),
            expected_version: 1,
        })
    }

    fn doc_with_id(id: Uuid) -> MigrationCoordinatorDocument {
        MigrationCoordinatorDocument {
            migration_id: id,
            ..doc()
        }
    }

    #[test]
    fn test_get_or_insert_keeps_first() {
        let registry = InstanceRegistry::new();
        let d = doc();
        let first = registry.get_or_insert(MigrationInstance::new(&d, MigrationPhase::DataCopied));
        let second = registry.get_or_insert(MigrationInstance::from_document(&d));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.try_phase(), Some(MigrationPhase::DataCopied));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_prune_only_expired_completed() {
        let registry = InstanceRegistry::new();
        let done = registry.get_or_insert(MigrationInstance::from_document(&doc()));
        registry.get_or_insert(MigrationInstance::from_document(&doc()));

        done.record_completed(Duration::ZERO);
        let expire_at = done.status().expire_at.unwrap();

        assert_eq!(registry.prune_expired(expire_at.saturating_sub(1)), 0);
        assert_eq!(registry.prune_expired(expire_at), 1);
        assert_eq!(registry.len(), 1);
        assert!(registry.get(done.id()).is_none());
    }

    #[tokio::test]
    async fn test_clear_active_keeps_instance_mid_step() {
        let registry = InstanceRegistry::new();
        let busy = registry.get_or_insert(MigrationInstance::from_document(&doc()));
        let idle = registry.get_or_insert(MigrationInstance::from_document(&doc()));

        let step = busy.lock_step().await;
        assert_eq!(registry.clear_active(), 1);
        assert!(registry.get(idle.id()).is_none());

        // A new stepper gets the same instance and waits on its lock
        let again = registry.get_or_insert(MigrationInstance::from_document(&doc_with_id(busy.id())));
        assert!(Arc::ptr_eq(&busy, &again));
        assert!(again.try_phase().is_none());

        drop(step);
        assert_eq!(registry.clear_active(), 1);
        assert!(registry.is_empty());
    }
}
