//! Decision engine: drives one migration through its phases
//!
//! Every step follows the same discipline: make the state change durable,
//! then act on it. A step that fails leaves the persisted document where it
//! was, so the next attempt (on this engine or on a successor after failover)
//! redoes at most the step in flight. Every remote call is idempotent.
//!
//! ```text
//! Created -> DataCopied -> AwaitingMetadataCommit -> DecisionDurable
//!         \___________________(clone failed)______/        |
//!                                                          v
//!             Forgotten <- CleanupConfirmed <- DecisionSent
//! ```

use crate::common::{Error, Result, RetryPolicy};
use crate::coordinator::checkpoint::{Checkpoint, MigrationObserver};
use crate::coordinator::cleanup::CleanupExecutor;
use crate::coordinator::document::{Decision, MigrationCoordinatorDocument, MigrationRequest};
use crate::coordinator::instance::{InstanceRegistry, MigrationInstance};
use crate::coordinator::rpc::{
    AbortChunkRequest, CloneOutcome, CloneRangeRequest, CommitChunkRequest, CommitOutcome,
    DecisionNotice, MetadataAuthority, MigrationStatusRequest, ParticipantClient, RecordedOutcome,
};
use crate::coordinator::store::CoordinatorStore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MigrationPhase {
    Created,
    DataCopied,
    AwaitingMetadataCommit,
    DecisionDurable,
    DecisionSent,
    CleanupConfirmed,
    Forgotten,
}

impl MigrationPhase {
    /// Phase implied by the persisted document alone.
    ///
    /// Progress that was never made durable is redone: a pending document
    /// restarts at `Created` (clone and commit are idempotent), a decided one
    /// resends its decision.
    pub fn from_document(doc: Option<&MigrationCoordinatorDocument>) -> Self {
        match doc {
            None => MigrationPhase::Forgotten,
            Some(doc) if doc.cleanup_confirmed => MigrationPhase::CleanupConfirmed,
            Some(doc) if doc.decision.is_terminal() => MigrationPhase::DecisionDurable,
            Some(_) => MigrationPhase::Created,
        }
    }

    /// Combine the in-memory phase with what is on disk. Memory may be
    /// ahead only for progress that needs no durable record.
    fn reconcile(self, doc: Option<&MigrationCoordinatorDocument>) -> Self {
        let durable = Self::from_document(doc);
        match durable {
            MigrationPhase::Created if self <= MigrationPhase::AwaitingMetadataCommit => self,
            MigrationPhase::DecisionDurable if self == MigrationPhase::DecisionSent => self,
            _ => durable,
        }
    }
}

impl fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Final result of a driven migration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationOutcome {
    pub migration_id: Uuid,
    pub decision: Decision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub retry: RetryPolicy,
    /// Delete the document as soon as cleanup is confirmed
    pub auto_forget: bool,
    /// How long a completed migration stays visible in status output
    pub status_retention: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            auto_forget: true,
            status_retention: Duration::from_secs(15 * 60),
        }
    }
}

pub struct DecisionEngine {
    store: Arc<CoordinatorStore>,
    authority: Arc<dyn MetadataAuthority>,
    participants: Arc<dyn ParticipantClient>,
    observer: Arc<dyn MigrationObserver>,
    cleanup: CleanupExecutor,
    registry: Arc<InstanceRegistry>,
    settings: EngineSettings,
    primary: AtomicBool,
}

impl DecisionEngine {
    pub fn new(
        store: Arc<CoordinatorStore>,
        authority: Arc<dyn MetadataAuthority>,
        participants: Arc<dyn ParticipantClient>,
        observer: Arc<dyn MigrationObserver>,
        settings: EngineSettings,
    ) -> Self {
        let cleanup = CleanupExecutor::new(
            store.clone(),
            participants.clone(),
            observer.clone(),
            settings.retry.clone(),
        );
        Self {
            store,
            authority,
            participants,
            observer,
            cleanup,
            registry: Arc::new(InstanceRegistry::new()),
            settings,
            primary: AtomicBool::new(true),
        }
    }

    pub fn store(&self) -> &Arc<CoordinatorStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    pub fn observer(&self) -> &Arc<dyn MigrationObserver> {
        &self.observer
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn is_primary(&self) -> bool {
        self.primary.load(Ordering::SeqCst)
    }

    /// Demoted engines refuse to take further steps
    pub fn set_primary(&self, primary: bool) {
        self.primary.store(primary, Ordering::SeqCst);
    }

    fn ensure_primary(&self) -> Result<()> {
        if self.is_primary() {
            Ok(())
        } else {
            Err(Error::NotPrimary("coordinator has stepped down".into()))
        }
    }

    async fn checkpoint(&self, id: Uuid, checkpoint: Checkpoint) -> Result<()> {
        self.observer.on_checkpoint(id, checkpoint).await
    }

    /// Persist a new pending document. Nothing else happens until the first
    /// `advance`.
    pub async fn start_migration(&self, request: MigrationRequest) -> Result<Uuid> {
        self.ensure_primary()?;
        request.range.validate()?;
        if request.namespace.is_empty() {
            return Err(Error::InvalidDocument("namespace must not be empty".into()));
        }
        if request.donor_shard == request.recipient_shard {
            return Err(Error::InvalidDocument(format!(
                "donor and recipient are both {}",
                request.donor_shard
            )));
        }

        let doc = MigrationCoordinatorDocument::new(request);
        let id = doc.migration_id;
        self.checkpoint(id, Checkpoint::BeforeCreatingCoordinatorDoc)
            .await?;
        self.store.create(&doc)?;
        self.registry
            .get_or_insert(MigrationInstance::new(&doc, MigrationPhase::Created));

        info!(
            migration_id = %id,
            namespace = %doc.namespace,
            range = %doc.range,
            donor = %doc.donor_shard,
            recipient = %doc.recipient_shard,
            "migration started"
        );
        Ok(id)
    }

    /// Registered instance, or one rebuilt from the persisted document
    fn instance(&self, id: Uuid) -> Result<Option<Arc<MigrationInstance>>> {
        if let Some(instance) = self.registry.get(id) {
            return Ok(Some(instance));
        }
        Ok(self
            .store
            .get(id)?
            .map(|doc| self.registry.get_or_insert(MigrationInstance::from_document(&doc))))
    }

    /// Perform the next protocol step and return the phase reached.
    ///
    /// Steps for one migration are serialized; a concurrent caller waits and
    /// then continues from wherever the first one left off.
    pub async fn advance(&self, id: Uuid) -> Result<MigrationPhase> {
        self.step(id, false).await
    }

    async fn step(&self, id: Uuid, force_forget: bool) -> Result<MigrationPhase> {
        self.ensure_primary()?;
        let Some(instance) = self.instance(id)? else {
            return Ok(MigrationPhase::Forgotten);
        };
        let mut phase = instance.lock_step().await;
        self.ensure_primary()?;

        let doc = self.store.get(id)?;
        let from = phase.reconcile(doc.as_ref());
        let Some(doc) = doc else {
            *phase = MigrationPhase::Forgotten;
            return Ok(MigrationPhase::Forgotten);
        };

        let to = match from {
            MigrationPhase::Created => self.copy_data(&instance, &doc).await?,
            MigrationPhase::DataCopied => MigrationPhase::AwaitingMetadataCommit,
            MigrationPhase::AwaitingMetadataCommit => self.commit_or_abort(&instance, &doc).await?,
            MigrationPhase::DecisionDurable => self.send_decision(&doc).await?,
            MigrationPhase::DecisionSent => {
                self.cleanup.run(&doc).await?;
                MigrationPhase::CleanupConfirmed
            }
            MigrationPhase::CleanupConfirmed if self.settings.auto_forget || force_forget => {
                self.forget(&instance, &doc).await?
            }
            MigrationPhase::CleanupConfirmed => MigrationPhase::CleanupConfirmed,
            MigrationPhase::Forgotten => MigrationPhase::Forgotten,
        };

        *phase = to;
        if to != from {
            instance.record_phase(to);
            self.observer.on_transition(id, from, to);
            debug!(migration_id = %id, %from, %to, "phase transition");
        }
        Ok(to)
    }

    async fn copy_data(
        &self,
        instance: &MigrationInstance,
        doc: &MigrationCoordinatorDocument,
    ) -> Result<MigrationPhase> {
        let id = doc.migration_id;
        instance.record_phase(MigrationPhase::Created);

        // A predecessor may have reached the authority without persisting
        // the decision. Once ownership moved, the recipient's copy is live.
        let query = MigrationStatusRequest {
            migration_id: id,
            namespace: doc.namespace.clone(),
        };
        let recorded = self
            .settings
            .retry
            .run("migrationStatus", || self.authority.migration_status(&query))
            .await?;
        match recorded {
            RecordedOutcome::Committed { new_version } => {
                info!(migration_id = %id, new_version, "authority already committed, skipping clone");
                self.decide(instance, id, Decision::Commit, None).await?;
                return Ok(MigrationPhase::DecisionDurable);
            }
            RecordedOutcome::Aborted => {
                warn!(migration_id = %id, "authority already aborted, skipping clone");
                self.decide(
                    instance,
                    id,
                    Decision::Abort,
                    Some("aborted by metadata authority".into()),
                )
                .await?;
                return Ok(MigrationPhase::DecisionDurable);
            }
            RecordedOutcome::Unknown => {}
        }

        self.checkpoint(id, Checkpoint::BeforeCloningRange).await?;

        let request = CloneRangeRequest {
            migration_id: id,
            namespace: doc.namespace.clone(),
            range: doc.range,
            donor_shard: doc.donor_shard.clone(),
            recipient_shard: doc.recipient_shard.clone(),
        };
        let outcome = self
            .settings
            .retry
            .run("cloneRange", || self.participants.clone_range(&request))
            .await?;

        match outcome {
            CloneOutcome::Cloned { documents } => {
                info!(migration_id = %id, documents, "range cloned to recipient");
                Ok(MigrationPhase::DataCopied)
            }
            CloneOutcome::Failed { reason } => {
                warn!(migration_id = %id, %reason, "clone failed, aborting migration");
                self.decide(instance, id, Decision::Abort, Some(format!("clone failed: {}", reason)))
                    .await?;
                Ok(MigrationPhase::DecisionDurable)
            }
        }
    }

    async fn commit_or_abort(
        &self,
        instance: &MigrationInstance,
        doc: &MigrationCoordinatorDocument,
    ) -> Result<MigrationPhase> {
        let id = doc.migration_id;
        self.checkpoint(id, Checkpoint::BeforeCommitAttempt).await?;

        let request = CommitChunkRequest {
            migration_id: id,
            namespace: doc.namespace.clone(),
            range: doc.range,
            donor_shard: doc.donor_shard.clone(),
            recipient_shard: doc.recipient_shard.clone(),
            expected_version: doc.collection_version,
        };
        let outcome = match self
            .settings
            .retry
            .run("commitChunk", || self.authority.commit_chunk(&request))
            .await
        {
            Ok(outcome) => outcome,
            Err(Error::VersionConflict(reason)) => CommitOutcome::VersionConflict { reason },
            Err(e) => return Err(e),
        };

        match outcome {
            CommitOutcome::Committed { new_version } => {
                info!(migration_id = %id, new_version, "metadata commit accepted");
                self.decide(instance, id, Decision::Commit, None).await?;
            }
            CommitOutcome::VersionConflict { reason } => {
                warn!(migration_id = %id, %reason, "metadata commit rejected");
                self.decide(
                    instance,
                    id,
                    Decision::Abort,
                    Some(format!("VersionConflict: {}", reason)),
                )
                .await?;
            }
        }
        Ok(MigrationPhase::DecisionDurable)
    }

    async fn decide(
        &self,
        instance: &MigrationInstance,
        id: Uuid,
        decision: Decision,
        abort_reason: Option<String>,
    ) -> Result<MigrationCoordinatorDocument> {
        let checkpoint = match decision {
            Decision::Commit => Checkpoint::BeforeMakingCommitDecisionDurable,
            _ => Checkpoint::BeforeMakingAbortDecisionDurable,
        };
        self.checkpoint(id, checkpoint).await?;
        let doc = self.store.set_decision(id, decision, abort_reason)?;
        instance.record_decision(&doc);
        info!(migration_id = %id, %decision, "decision durable");
        Ok(doc)
    }

    async fn send_decision(&self, doc: &MigrationCoordinatorDocument) -> Result<MigrationPhase> {
        let id = doc.migration_id;
        let checkpoint = match doc.decision {
            Decision::Commit => Checkpoint::BeforeSendingCommitDecision,
            _ => Checkpoint::BeforeSendingAbortDecision,
        };
        self.checkpoint(id, checkpoint).await?;

        if doc.decision == Decision::Abort {
            let request = AbortChunkRequest {
                migration_id: id,
                namespace: doc.namespace.clone(),
                range: doc.range,
            };
            self.settings
                .retry
                .run("abortChunk", || self.authority.abort_chunk(&request))
                .await?;
        }

        let notice = DecisionNotice {
            migration_id: id,
            namespace: doc.namespace.clone(),
            range: doc.range,
            decision: doc.decision,
        };
        for shard in [&doc.donor_shard, &doc.recipient_shard] {
            self.settings
                .retry
                .run("deliverDecision", || {
                    self.participants.deliver_decision(shard, &notice)
                })
                .await?;
        }
        info!(migration_id = %id, decision = %doc.decision, "decision delivered to participants");
        Ok(MigrationPhase::DecisionSent)
    }

    async fn forget(
        &self,
        instance: &MigrationInstance,
        doc: &MigrationCoordinatorDocument,
    ) -> Result<MigrationPhase> {
        let id = doc.migration_id;
        let checkpoint = match doc.decision {
            Decision::Commit => Checkpoint::BeforeForgettingMigrationAfterCommitDecision,
            _ => Checkpoint::BeforeForgettingMigrationAfterAbortDecision,
        };
        self.checkpoint(id, checkpoint).await?;
        instance.record_decision(doc);
        instance.record_completed(self.settings.status_retention);
        self.store.delete(id)?;
        info!(migration_id = %id, decision = %doc.decision, "migration forgotten");
        Ok(MigrationPhase::Forgotten)
    }

    /// Advance until the migration is forgotten, or parked at
    /// `CleanupConfirmed` when auto-forget is off.
    pub async fn run_to_completion(&self, id: Uuid) -> Result<MigrationOutcome> {
        loop {
            match self.advance(id).await? {
                MigrationPhase::Forgotten => break,
                MigrationPhase::CleanupConfirmed if !self.settings.auto_forget => break,
                _ => {}
            }
        }
        self.outcome(id)
    }

    /// Decision of a migration known to this engine
    pub fn outcome(&self, id: Uuid) -> Result<MigrationOutcome> {
        let status = self
            .registry
            .get(id)
            .map(|instance| instance.status())
            .ok_or_else(|| Error::NotFound(format!("migration {}", id)))?;
        Ok(MigrationOutcome {
            migration_id: id,
            decision: status.decision(),
            abort_reason: status.abort_reason,
        })
    }

    /// Drive a decided migration to deletion. Unknown or already-deleted
    /// ids succeed without doing anything.
    pub async fn forget_migration(&self, id: Uuid) -> Result<()> {
        loop {
            if self.step(id, true).await? == MigrationPhase::Forgotten {
                return Ok(());
            }
        }
    }
}
