//! Coordinator service: the public face of the migration protocol

use crate::common::{Error, Result};
use crate::coordinator::document::MigrationRequest;
use crate::coordinator::engine::{DecisionEngine, MigrationOutcome, MigrationPhase};
use crate::coordinator::recovery::{RecoveryManager, RecoveryReport};
use crate::coordinator::status::{MigrationStatus, StatusReporter};
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::task::AbortHandle;
use uuid::Uuid;

pub struct MigrationCoordinator {
    engine: Arc<DecisionEngine>,
    status: StatusReporter,
    // Driver and recovery tasks, aborted on step-down
    tasks: Mutex<Vec<AbortHandle>>,
}

impl MigrationCoordinator {
    pub fn new(engine: Arc<DecisionEngine>) -> Self {
        let status = StatusReporter::new(engine.registry().clone());
        Self {
            engine,
            status,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn engine(&self) -> &Arc<DecisionEngine> {
        &self.engine
    }

    pub fn is_primary(&self) -> bool {
        self.engine.is_primary()
    }

    fn ensure_primary(&self) -> Result<()> {
        if self.engine.is_primary() {
            Ok(())
        } else {
            Err(Error::NotPrimary("coordinator is not primary".into()))
        }
    }

    /// Run `fut` as a tracked task and wait for it
    async fn tracked<T, F>(&self, what: &str, fut: F) -> Result<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let handle = tokio::spawn(fut);
        {
            let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
            tasks.retain(|t| !t.is_finished());
            tasks.push(handle.abort_handle());
        }
        match handle.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(Error::NotPrimary(format!(
                "{} cancelled by step-down",
                what
            ))),
            Err(e) => Err(Error::Internal(format!("{} task failed: {}", what, e))),
        }
    }

    /// Start a migration and wait for its outcome
    pub async fn move_chunk(&self, request: MigrationRequest) -> Result<MigrationOutcome> {
        self.ensure_primary()?;
        let engine = self.engine.clone();
        self.tracked("moveChunk", async move {
            let id = engine.start_migration(request).await?;
            engine.run_to_completion(id).await
        })
        .await
    }

    /// Persist a new migration and drive it in the background
    pub async fn start_migration(self: &Arc<Self>, request: MigrationRequest) -> Result<Uuid> {
        let id = self.engine.start_migration(request).await?;
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.drive(id).await {
                tracing::warn!(migration_id = %id, error = %e, "background migration stopped");
            }
        });
        Ok(id)
    }

    /// Drive an existing migration until it is forgotten (or parked when
    /// auto-forget is off)
    pub async fn drive(&self, id: Uuid) -> Result<MigrationOutcome> {
        self.ensure_primary()?;
        let engine = self.engine.clone();
        self.tracked("migration driver", async move { engine.run_to_completion(id).await })
            .await
    }

    /// Single protocol step, mostly for tests and tooling
    pub async fn advance(&self, id: Uuid) -> Result<MigrationPhase> {
        self.ensure_primary()?;
        let engine = self.engine.clone();
        self.tracked("advance", async move { engine.advance(id).await })
            .await
    }

    pub async fn forget_migration(&self, id: Uuid) -> Result<()> {
        self.ensure_primary()?;
        let engine = self.engine.clone();
        self.tracked("forgetMigration", async move { engine.forget_migration(id).await })
            .await
    }

    pub fn current_op(&self) -> Vec<MigrationStatus> {
        self.status.current_op()
    }

    pub fn status_of(&self, id: Uuid) -> Option<MigrationStatus> {
        self.status.get(id)
    }

    /// Become primary and resume every persisted migration
    pub async fn step_up(&self) -> Result<RecoveryReport> {
        self.engine.set_primary(true);
        tracing::info!("coordinator stepping up, recovering migrations");
        let recovery = RecoveryManager::new(self.engine.clone());
        self.tracked("recovery", async move { recovery.recover().await })
            .await
    }

    /// Stop driving migrations. Persisted documents are left for the next
    /// primary; in-memory progress of unfinished migrations is discarded
    /// once their cancelled step has let go of the instance.
    pub fn step_down(&self) {
        self.engine.set_primary(false);
        self.engine.observer().on_stop();

        let handles: Vec<_> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
            tasks.drain(..).collect()
        };
        let aborted = handles.iter().filter(|h| !h.is_finished()).count();
        for handle in handles {
            handle.abort();
        }
        let discarded = self.engine.registry().clear_active();
        tracing::info!(aborted, discarded, "coordinator stepped down");
    }
}
