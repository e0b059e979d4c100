//! Oplog replay onto a secondary whose index catalog is ahead of the log

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use chunkshift::common::SequenceGenerator;
use chunkshift::shard::{shard_router, IndexSpec, OplogEntry, ShardNode, ShardState};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tower::ServiceExt;

const NS: &str = "db.replay";

fn shard(name: &str) -> (Router, Arc<ShardNode>) {
    let node = Arc::new(ShardNode::new(name, SequenceGenerator::new(name)));
    let state = ShardState::new(node.clone(), HashMap::new(), reqwest::Client::new());
    (shard_router(state), node)
}

fn unique_a0() -> IndexSpec {
    IndexSpec {
        name: "a.0_1".into(),
        path: "a.0".into(),
        unique: true,
    }
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    let request = match body {
        Some(body) => builder.body(Body::from(body.to_string())).unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let resp = app.clone().oneshot(request).await.unwrap();
    let status = resp.status();
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

#[tokio::test]
async fn test_replay_ignores_stale_unique_violations() {
    let (primary_app, primary) = shard("primary");
    let (secondary_app, secondary) = shard("secondary");
    let docs_uri = format!("/collections/{}/documents", NS);

    // Primary history: the conflicting document is gone before the index exists
    let (status, _) = send(&primary_app, "POST", &docs_uri, Some(json!({"_id": 1, "a": [9]}))).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = send(
        &primary_app,
        "POST",
        "/ranges/delete",
        Some(json!({"namespace": NS, "range": {"min": 0, "max": 2}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deleted"], 1);
    let (status, _) = send(
        &primary_app,
        "POST",
        &docs_uri,
        Some(json!({"_id": 2, "a": {"0": 9}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(
        &primary_app,
        "POST",
        &format!("/collections/{}/indexes", NS),
        Some(serde_json::to_value(unique_a0()).unwrap()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Secondary already has the index and the final document
    secondary.create_index(NS, unique_a0()).unwrap();
    secondary
        .insert(NS, json!({"_id": 2, "a": {"0": 9}}))
        .unwrap();

    let (status, log) = send(&primary_app, "GET", "/oplog", None).await;
    assert_eq!(status, StatusCode::OK);
    let entries: Vec<OplogEntry> = serde_json::from_value(log.clone()).unwrap();
    assert_eq!(entries.len(), 4);
    assert_eq!(log[0]["op"], "insert");
    assert_eq!(log[3]["op"], "createIndex");

    let (status, report) = send(&secondary_app, "POST", "/oplog/apply", Some(log)).await;
    assert_eq!(status, StatusCode::OK, "{}", report);
    assert_eq!(report["applied"], 4);
    assert_eq!(report["indexViolations"], 1);

    let range = chunkshift::ChunkRange::full();
    assert_eq!(secondary.fetch_range(NS, &range), primary.fetch_range(NS, &range));
    assert_eq!(secondary.index_specs(NS), vec![unique_a0()]);

    // Replay never logs
    assert_eq!(secondary.oplog().len(), 2);

    // The index is fully enforced for new writes
    let (status, body) = send(
        &secondary_app,
        "POST",
        &docs_uri,
        Some(json!({"_id": 3, "a": [9]})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "DuplicateKey");
    assert!(secondary.get(NS, 3).is_none());
}

#[tokio::test]
async fn test_replay_is_repeatable() {
    let (_, primary) = shard("primary");
    let (_, secondary) = shard("secondary");
    for id in 0..10 {
        primary.insert(NS, json!({"_id": id, "tag": id % 3})).unwrap();
    }
    primary
        .create_index(
            NS,
            IndexSpec {
                name: "tag_1".into(),
                path: "tag".into(),
                unique: false,
            },
        )
        .unwrap();

    let entries = primary.oplog();
    let first = secondary.apply_oplog(&entries).unwrap();
    let second = secondary.apply_oplog(&entries).unwrap();
    assert_eq!(first.applied, 11);
    assert_eq!(second.index_violations, 0);
    assert_eq!(secondary.count(NS), 10);
    assert_eq!(
        secondary.fetch_range(NS, &chunkshift::ChunkRange::full()),
        primary.fetch_range(NS, &chunkshift::ChunkRange::full())
    );
}
