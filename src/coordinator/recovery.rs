//! Step-up recovery: resume every migration that has a document on disk

use crate::common::{Error, Result};
use crate::coordinator::document::Decision;
use crate::coordinator::engine::DecisionEngine;
use crate::coordinator::instance::MigrationInstance;
use crate::coordinator::store::ScannedDocument;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Result of one recovery pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryReport {
    /// Documents found and resumed
    pub resumed: Vec<Uuid>,
    /// Migrations driven to the end, with their decision
    pub completed: Vec<(Uuid, Decision)>,
    /// Unreadable documents and migrations whose decision contradicts the
    /// authority, left in place for an operator
    pub corrupt: Vec<String>,
    /// Migrations whose driver stopped with an error
    pub failed: Vec<(Uuid, String)>,
}

impl RecoveryReport {
    pub fn is_clean(&self) -> bool {
        self.corrupt.is_empty() && self.failed.is_empty()
    }
}

pub struct RecoveryManager {
    engine: Arc<DecisionEngine>,
}

impl RecoveryManager {
    pub fn new(engine: Arc<DecisionEngine>) -> Self {
        Self { engine }
    }

    /// Register an instance for every active document, positioned by the
    /// document's fields. Corrupt documents are reported, never guessed at.
    pub fn rebuild(&self) -> Result<(Vec<Uuid>, Vec<String>)> {
        let mut resumed = Vec::new();
        let mut corrupt = Vec::new();
        for scanned in self.engine.store().scan_active()? {
            match scanned {
                ScannedDocument::Valid(doc) => {
                    self.engine
                        .registry()
                        .get_or_insert(MigrationInstance::from_document(&doc));
                    resumed.push(doc.migration_id);
                }
                ScannedDocument::Corrupt { key, reason, .. } => {
                    tracing::error!(key = %key, %reason, "corrupt coordinator document, skipping");
                    corrupt.push(key);
                }
            }
        }
        Ok((resumed, corrupt))
    }

    /// Rebuild, then drive every resumed migration to completion concurrently
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let (resumed, corrupt) = self.rebuild()?;
        tracing::info!(
            resumed = resumed.len(),
            corrupt = corrupt.len(),
            "recovering migrations"
        );

        let drivers = resumed.iter().map(|&id| {
            let engine = self.engine.clone();
            async move { (id, engine.run_to_completion(id).await) }
        });

        let mut report = RecoveryReport {
            resumed: resumed.clone(),
            corrupt,
            ..Default::default()
        };
        for (id, result) in join_all(drivers).await {
            match result {
                Ok(outcome) => report.completed.push((id, outcome.decision)),
                Err(e @ Error::CorruptState { .. }) => {
                    tracing::error!(migration_id = %id, error = %e, "migration is in a corrupt state");
                    report.corrupt.push(id.to_string());
                }
                Err(e) => {
                    tracing::warn!(migration_id = %id, error = %e, "recovery driver stopped");
                    report.failed.push((id, e.to_string()));
                }
            }
        }
        tracing::info!(
            completed = report.completed.len(),
            failed = report.failed.len(),
            "recovery finished"
        );
        Ok(report)
    }
}
