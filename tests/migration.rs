//! End-to-end migrations against an in-process cluster

mod common;

use chunkshift::authority::COMMIT_VERSION_ERROR_FAILPOINT;
use chunkshift::common::SequenceGenerator;
use chunkshift::coordinator::rpc::ParticipantClient;
use chunkshift::coordinator::{Decision, DurableState, EngineSettings, MigrationPhase};
use chunkshift::shard::IndexSpec;
use chunkshift::Error;
use common::{fast_settings, moved_range, Cluster, FlakyParticipants, DONOR, RECIPIENT};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use uuid::Uuid;

fn parked_settings() -> EngineSettings {
    EngineSettings {
        auto_forget: false,
        ..fast_settings()
    }
}

#[tokio::test]
async fn test_move_chunk_commits() {
    let mut names = SequenceGenerator::new("happy");
    let cluster = Cluster::new(&mut names);
    let coordinator = cluster.coordinator();

    let outcome = coordinator.move_chunk(cluster.request()).await.unwrap();
    assert_eq!(outcome.decision, Decision::Commit);
    assert_eq!(outcome.abort_reason, None);

    let id = outcome.migration_id;
    assert_eq!(cluster.owner(), RECIPIENT);
    assert_eq!(cluster.donor.decision(id), Some(Decision::Commit));
    assert_eq!(cluster.recipient.decision(id), Some(Decision::Commit));
    assert!(cluster.stored_ids().is_empty());
    cluster.assert_conserved();

    let phases: Vec<MigrationPhase> = cluster
        .failpoints
        .transitions()
        .into_iter()
        .filter(|(m, _, _)| *m == id)
        .map(|(_, _, to)| to)
        .collect();
    assert_eq!(
        phases,
        vec![
            MigrationPhase::DataCopied,
            MigrationPhase::AwaitingMetadataCommit,
            MigrationPhase::DecisionDurable,
            MigrationPhase::DecisionSent,
            MigrationPhase::CleanupConfirmed,
            MigrationPhase::Forgotten,
        ]
    );

    let ops = coordinator.current_op();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].migration_id, id);
    assert_eq!(ops[0].last_durable_state, DurableState::Committed);
    assert!(ops[0].migration_completed);
    assert!(ops[0].block_timestamp.is_some());
    assert!(ops[0].commit_or_abort_op_time.is_some());
    assert!(ops[0].expire_at.is_some());
}

#[tokio::test]
async fn test_commit_rejection_aborts() {
    let mut names = SequenceGenerator::new("rejected");
    let cluster = Cluster::new(&mut names);
    cluster
        .authority
        .set_failpoint(COMMIT_VERSION_ERROR_FAILPOINT, true)
        .unwrap();

    let outcome = cluster
        .coordinator()
        .move_chunk(cluster.request())
        .await
        .unwrap();
    assert_eq!(outcome.decision, Decision::Abort);
    let reason = outcome.abort_reason.unwrap();
    assert!(reason.contains("VersionConflict"), "{}", reason);

    assert!(cluster
        .authority
        .was_aborted(&cluster.namespace, outcome.migration_id));
    assert_eq!(cluster.owner(), DONOR);
    assert_eq!(
        cluster.recipient.decision(outcome.migration_id),
        Some(Decision::Abort)
    );
    cluster.assert_conserved();
}

#[tokio::test]
async fn test_stale_version_aborts() {
    let mut names = SequenceGenerator::new("stale");
    let cluster = Cluster::new(&mut names);
    let mut request = cluster.request();
    request.expected_version = 1;

    let outcome = cluster.coordinator().move_chunk(request).await.unwrap();
    assert_eq!(outcome.decision, Decision::Abort);
    assert!(outcome
        .abort_reason
        .unwrap()
        .contains("expected version 1, found 2"));
    assert_eq!(cluster.owner(), DONOR);
    cluster.assert_conserved();
}

#[tokio::test]
async fn test_invalid_request_persists_nothing() {
    let mut names = SequenceGenerator::new("invalid");
    let cluster = Cluster::new(&mut names);
    let mut request = cluster.request();
    request.recipient_shard = DONOR.into();

    let err = cluster
        .coordinator()
        .move_chunk(request)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidDocument(_)));
    assert!(cluster.stored_ids().is_empty());
}

#[tokio::test]
async fn test_overlapping_migration_conflicts() {
    let mut names = SequenceGenerator::new("overlap");
    let cluster = Cluster::new(&mut names);
    let coordinator = cluster.coordinator();

    let first = coordinator
        .engine()
        .start_migration(cluster.request())
        .await
        .unwrap();

    let mut request = cluster.request();
    request.range = chunkshift::ChunkRange::new(10, 20).unwrap();
    let err = coordinator.engine().start_migration(request).await.unwrap_err();
    assert!(matches!(err, Error::Conflict { .. }));
    assert_eq!(cluster.stored_ids(), vec![first]);

    // Once the first is gone the range is free again
    coordinator.drive(first).await.unwrap();
    assert!(cluster.stored_ids().is_empty());
}

#[tokio::test]
async fn test_forget_is_idempotent() {
    let mut names = SequenceGenerator::new("forget");
    let cluster = Cluster::new(&mut names);
    let coordinator = cluster.coordinator_with(parked_settings());

    let outcome = coordinator.move_chunk(cluster.request()).await.unwrap();
    let id = outcome.migration_id;
    assert_eq!(outcome.decision, Decision::Commit);

    // Parked: decided and cleaned up, but the document is still there
    let doc = cluster.store().get(id).unwrap().unwrap();
    assert!(doc.cleanup_confirmed);
    assert!(!coordinator.status_of(id).unwrap().migration_completed);

    coordinator.forget_migration(id).await.unwrap();
    assert!(cluster.store().get(id).unwrap().is_none());
    assert!(coordinator.status_of(id).unwrap().migration_completed);

    coordinator.forget_migration(id).await.unwrap();
    coordinator.forget_migration(Uuid::new_v4()).await.unwrap();
    cluster.assert_conserved();
}

#[tokio::test]
async fn test_forget_pending_migration_decides_first() {
    let mut names = SequenceGenerator::new("forgetpending");
    let cluster = Cluster::new(&mut names);
    let coordinator = cluster.coordinator_with(parked_settings());

    let id = coordinator
        .engine()
        .start_migration(cluster.request())
        .await
        .unwrap();
    coordinator.forget_migration(id).await.unwrap();

    assert!(cluster.stored_ids().is_empty());
    assert!(cluster.authority.was_committed(&cluster.namespace, id));
    let status = coordinator.status_of(id).unwrap();
    assert_eq!(status.last_durable_state, DurableState::Committed);
    assert!(status.migration_completed);
    cluster.assert_conserved();
}

#[tokio::test]
async fn test_concurrent_drivers_commit_once() {
    let mut names = SequenceGenerator::new("concurrent");
    let cluster = Cluster::new(&mut names);
    let coordinator = cluster.coordinator();
    let engine = coordinator.engine().clone();

    let id = engine.start_migration(cluster.request()).await.unwrap();
    let drivers: Vec<_> = (0..8)
        .map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.run_to_completion(id).await })
        })
        .collect();
    for driver in drivers {
        let outcome = driver.await.unwrap().unwrap();
        assert_eq!(outcome.decision, Decision::Commit);
    }

    assert_eq!(cluster.authority.commit_calls(), 1);
    assert_eq!(
        cluster
            .authority
            .chunk(&cluster.namespace, &moved_range())
            .unwrap()
            .version,
        3
    );
    cluster.assert_conserved();
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let mut names = SequenceGenerator::new("flaky");
    let cluster = Cluster::new(&mut names);
    let flaky = Arc::new(FlakyParticipants::new(cluster.participants.clone(), 3));
    let participants: Arc<dyn ParticipantClient> = flaky.clone();
    let cluster = cluster.with_participants(participants);

    let outcome = cluster
        .coordinator()
        .move_chunk(cluster.request())
        .await
        .unwrap();
    assert_eq!(outcome.decision, Decision::Commit);
    // clone + two decision deliveries + delete, plus the three failures
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 7);
    cluster.assert_conserved();
}

#[tokio::test]
async fn test_clone_failure_aborts() {
    let mut names = SequenceGenerator::new("clonefail");
    let cluster = Cluster::new(&mut names);
    cluster
        .recipient
        .create_index(
            &cluster.namespace,
            IndexSpec {
                name: "v_1".into(),
                path: "v".into(),
                unique: true,
            },
        )
        .unwrap();
    cluster
        .recipient
        .insert(&cluster.namespace, json!({"_id": -1000, "v": 10}))
        .unwrap();

    let outcome = cluster
        .coordinator()
        .move_chunk(cluster.request())
        .await
        .unwrap();
    assert_eq!(outcome.decision, Decision::Abort);
    assert!(outcome.abort_reason.unwrap().starts_with("clone failed"));
    assert!(!cluster
        .authority
        .was_committed(&cluster.namespace, outcome.migration_id));

    // Partially cloned documents were removed from the recipient
    assert_eq!(cluster.owner(), DONOR);
    assert_eq!(
        cluster
            .recipient
            .count_in_range(&cluster.namespace, &moved_range()),
        0
    );
    assert_eq!(cluster.recipient.count(&cluster.namespace), 1);
    assert_eq!(
        cluster
            .donor
            .count_in_range(&cluster.namespace, &moved_range()),
        common::DOCS_PER_CHUNK as usize
    );
}
