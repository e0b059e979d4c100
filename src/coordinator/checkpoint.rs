//! Protocol checkpoints and the observer hook interface
//!
//! Every durable write and every external send of the decision engine is
//! preceded by a named checkpoint. An injected [`MigrationObserver`] sees each
//! one and may pause the step or fail it, which is how tests force a
//! step-down at an exact protocol position.

use crate::common::{Error, Result};
use crate::coordinator::engine::MigrationPhase;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use tokio::sync::Notify;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Checkpoint {
    BeforeCreatingCoordinatorDoc,
    BeforeCloningRange,
    BeforeCommitAttempt,
    BeforeMakingCommitDecisionDurable,
    BeforeMakingAbortDecisionDurable,
    BeforeSendingCommitDecision,
    BeforeSendingAbortDecision,
    BeforeDeletingRange,
    BeforeConfirmingCleanup,
    BeforeForgettingMigrationAfterCommitDecision,
    BeforeForgettingMigrationAfterAbortDecision,
}

impl Checkpoint {
    pub const ALL: [Checkpoint; 11] = [
        Checkpoint::BeforeCreatingCoordinatorDoc,
        Checkpoint::BeforeCloningRange,
        Checkpoint::BeforeCommitAttempt,
        Checkpoint::BeforeMakingCommitDecisionDurable,
        Checkpoint::BeforeMakingAbortDecisionDurable,
        Checkpoint::BeforeSendingCommitDecision,
        Checkpoint::BeforeSendingAbortDecision,
        Checkpoint::BeforeDeletingRange,
        Checkpoint::BeforeConfirmingCleanup,
        Checkpoint::BeforeForgettingMigrationAfterCommitDecision,
        Checkpoint::BeforeForgettingMigrationAfterAbortDecision,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Checkpoint::BeforeCreatingCoordinatorDoc => "hangBeforeCreatingCoordinatorDoc",
            Checkpoint::BeforeCloningRange => "hangBeforeCloningRange",
            Checkpoint::BeforeCommitAttempt => "hangBeforeCommitAttempt",
            Checkpoint::BeforeMakingCommitDecisionDurable => {
                "hangBeforeMakingCommitDecisionDurable"
            }
            Checkpoint::BeforeMakingAbortDecisionDurable => "hangBeforeMakingAbortDecisionDurable",
            Checkpoint::BeforeSendingCommitDecision => "hangBeforeSendingCommitDecision",
            Checkpoint::BeforeSendingAbortDecision => "hangBeforeSendingAbortDecision",
            Checkpoint::BeforeDeletingRange => "hangBeforeDeletingRange",
            Checkpoint::BeforeConfirmingCleanup => "hangBeforeConfirmingCleanup",
            Checkpoint::BeforeForgettingMigrationAfterCommitDecision => {
                "hangBeforeForgettingMigrationAfterCommitDecision"
            }
            Checkpoint::BeforeForgettingMigrationAfterAbortDecision => {
                "hangBeforeForgettingMigrationAfterAbortDecision"
            }
        }
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Checkpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Checkpoint::ALL
            .iter()
            .copied()
            .find(|cp| cp.name() == s)
            .ok_or_else(|| Error::NotFound(format!("unknown checkpoint {}", s)))
    }
}

/// Lifecycle hooks injected into the engine at construction
#[async_trait]
pub trait MigrationObserver: Send + Sync {
    /// Called before a durable write or external send. An error aborts the
    /// current step without touching persisted state.
    async fn on_checkpoint(&self, _migration_id: Uuid, _checkpoint: Checkpoint) -> Result<()> {
        Ok(())
    }

    /// Called after each phase change
    fn on_transition(&self, _migration_id: Uuid, _from: MigrationPhase, _to: MigrationPhase) {}

    /// Called before the coordinator stops driving migrations (step-down)
    fn on_stop(&self) {}
}

/// Observer that does nothing
pub struct NoopObserver;

impl MigrationObserver for NoopObserver {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPointMode {
    Off,
    /// Block the step until the fail point is turned off
    Pause,
    /// Fail the step with `Error::Interrupted`
    Interrupt,
}

#[derive(Debug, Clone, Copy)]
struct FailPointState {
    mode: FailPointMode,
    hits: u64,
}

/// Deterministic fault injection keyed by checkpoint
pub struct FailPoints {
    points: Mutex<HashMap<Checkpoint, FailPointState>>,
    changed: Notify,
    transitions: Mutex<Vec<(Uuid, MigrationPhase, MigrationPhase)>>,
}

impl Default for FailPoints {
    fn default() -> Self {
        Self::new()
    }
}

impl FailPoints {
    pub fn new() -> Self {
        Self {
            points: Mutex::new(HashMap::new()),
            changed: Notify::new(),
            transitions: Mutex::new(Vec::new()),
        }
    }

    fn points(&self) -> std::sync::MutexGuard<'_, HashMap<Checkpoint, FailPointState>> {
        self.points
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Set the mode and reset the hit counter
    pub fn configure(&self, checkpoint: Checkpoint, mode: FailPointMode) {
        self.points()
            .insert(checkpoint, FailPointState { mode, hits: 0 });
        self.changed.notify_waiters();
    }

    /// Turn off, releasing anything paused on it. The hit counter is kept.
    pub fn off(&self, checkpoint: Checkpoint) {
        if let Some(state) = self.points().get_mut(&checkpoint) {
            state.mode = FailPointMode::Off;
        }
        self.changed.notify_waiters();
    }

    pub fn times_entered(&self, checkpoint: Checkpoint) -> u64 {
        self.points().get(&checkpoint).map(|s| s.hits).unwrap_or(0)
    }

    /// Wait until the checkpoint has been reached at least once since it was
    /// configured
    pub async fn wait_for_hit(&self, checkpoint: Checkpoint) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.times_entered(checkpoint) > 0 {
                return;
            }
            notified.await;
        }
    }

    /// Every phase change seen so far
    pub fn transitions(&self) -> Vec<(Uuid, MigrationPhase, MigrationPhase)> {
        self.transitions
            .lock()
            .map(|t| t.clone())
            .unwrap_or_default()
    }

    fn mode(&self, checkpoint: Checkpoint) -> FailPointMode {
        self.points()
            .get(&checkpoint)
            .map(|s| s.mode)
            .unwrap_or(FailPointMode::Off)
    }
}

#[async_trait]
impl MigrationObserver for FailPoints {
    async fn on_checkpoint(&self, migration_id: Uuid, checkpoint: Checkpoint) -> Result<()> {
        let mode = {
            let mut points = self.points();
            match points.get_mut(&checkpoint) {
                Some(state) if state.mode != FailPointMode::Off => {
                    state.hits += 1;
                    state.mode
                }
                _ => return Ok(()),
            }
        };
        self.changed.notify_waiters();
        tracing::info!(%migration_id, %checkpoint, ?mode, "fail point hit");

        match mode {
            FailPointMode::Off => Ok(()),
            FailPointMode::Interrupt => Err(Error::Interrupted(checkpoint.name().to_string())),
            FailPointMode::Pause => {
                loop {
                    let notified = self.changed.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();
                    if self.mode(checkpoint) != FailPointMode::Pause {
                        break;
                    }
                    notified.await;
                }
                Ok(())
            }
        }
    }

    fn on_transition(&self, migration_id: Uuid, from: MigrationPhase, to: MigrationPhase) {
        if let Ok(mut transitions) = self.transitions.lock() {
            transitions.push((migration_id, from, to));
        }
    }
}
