//! Cleanup of the losing side's copy of a decided migration

use crate::common::{Error, Result, RetryPolicy};
use crate::coordinator::checkpoint::{Checkpoint, MigrationObserver};
use crate::coordinator::document::MigrationCoordinatorDocument;
use crate::coordinator::rpc::ParticipantClient;
use crate::coordinator::store::CoordinatorStore;
use std::sync::Arc;

pub struct CleanupExecutor {
    store: Arc<CoordinatorStore>,
    participants: Arc<dyn ParticipantClient>,
    observer: Arc<dyn MigrationObserver>,
    retry: RetryPolicy,
}

impl CleanupExecutor {
    pub fn new(
        store: Arc<CoordinatorStore>,
        participants: Arc<dyn ParticipantClient>,
        observer: Arc<dyn MigrationObserver>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            participants,
            observer,
            retry,
        }
    }

    /// Delete the range on the losing shard, then persist `cleanupConfirmed`.
    ///
    /// Safe to repeat: deleting an already-empty range succeeds.
    pub async fn run(&self, doc: &MigrationCoordinatorDocument) -> Result<MigrationCoordinatorDocument> {
        let id = doc.migration_id;
        let losing = doc.losing_shard().ok_or_else(|| {
            Error::InvariantViolation(format!("cleanup of undecided migration {}", id))
        })?;
        if doc.cleanup_confirmed {
            return Ok(doc.clone());
        }

        self.observer
            .on_checkpoint(id, Checkpoint::BeforeDeletingRange)
            .await?;
        let deleted = self
            .retry
            .run("deleteRange", || {
                self.participants.delete_range(losing, &doc.namespace, doc.range)
            })
            .await?;
        tracing::info!(
            migration_id = %id,
            shard = losing,
            range = %doc.range,
            deleted,
            "range deleted on losing shard"
        );

        self.observer
            .on_checkpoint(id, Checkpoint::BeforeConfirmingCleanup)
            .await?;
        self.store.mark_cleanup_confirmed(id)
    }
}
