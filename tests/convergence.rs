#![forbid(unsafe_code)]

//! End-to-end convergence scenarios (spec §8): replication fan-out,
//! tombstone convergence, conflict resolution, corruption rejection, and
//! peer reaping, each driven through real components over loopback TCP.

mod support;

use meshfs::core::codec::now_secs;
use meshfs::core::types::{Envelope, FileOperation, FileRecord, Liveness, MessageType};
use meshfs::networking::heartbeat::HeartbeatService;
use meshfs::networking::replication::SyncFilePayload;
use ring::digest;
use std::sync::Arc;
use std::time::Duration;
use support::{roundtrip, spawn_node, spawn_node_with_retry};

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(digest::digest(&digest::SHA256, bytes).as_ref())
}

// S1 — basic replication: a local create+write on A fans out to B.
#[tokio::test]
async fn s1_basic_replication_converges_within_one_round() {
    let a = spawn_node("node-a").await;
    let b = spawn_node("node-b").await;
    a.observe(&b);
    b.observe(&a);

    a.send_command("create", "a.txt", serde_json::Value::Null).await;
    // Let the create's replication push land before the write's, so the two
    // pushes can't race each other out of order on independent connections.
    tokio::time::sleep(Duration::from_millis(100)).await;
    a.send_command("write", "a.txt", serde_json::json!(b"hello".to_vec())).await;

    // Push fans out on a background task; give it a moment to land.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let resp = b.send_command("read", "a.txt", serde_json::Value::Null).await;
    let data: Vec<u8> = serde_json::from_value(resp.content["data"].clone()).unwrap();
    assert_eq!(data, b"hello");

    let record = b.metadata.get("a.txt").unwrap().unwrap();
    assert_eq!(record.version, 2);
    assert_eq!(record.checksum, sha256_hex(b"hello"));
    assert_eq!(record.originating_node_id, "node-a");
}

// S2 — delete tombstone: B was never aware of A's writes, converges only
// once it reconciles after the fact ("starting cold afterward").
#[tokio::test]
async fn s2_delete_tombstone_converges_on_cold_reconcile() {
    let a = spawn_node("node-a").await;
    let b = spawn_node("node-b").await;
    // A mutates alone; B is not yet a known peer, so push fans out to nobody.
    a.send_command("create", "x.txt", serde_json::Value::Null).await;
    a.send_command("write", "x.txt", serde_json::json!(b"content".to_vec())).await;
    a.send_command("delete", "x.txt", serde_json::Value::Null).await;

    a.observe(&b);
    b.observe(&a);
    b.replication.reconcile_with_peer(&a.peer()).await.unwrap();

    let record = b.metadata.get("x.txt").unwrap().unwrap();
    assert!(record.is_deleted);
    assert!(record.version >= 2);

    let resp = b.send_command("read", "x.txt", serde_json::Value::Null).await;
    assert_eq!(resp.content["success"], false);
    assert!(resp.content["message"].as_str().unwrap().contains("not_found"));
}

// S3 — conflict, timestamp wins: A and B independently write the same
// filepath while partitioned; the later timestamp wins on both sides.
#[tokio::test]
async fn s3_conflict_resolves_by_later_timestamp() {
    let a = spawn_node("node-a").await;
    let b = spawn_node("node-b").await;

    a.send_command("write", "f", serde_json::json!(b"A".to_vec())).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    b.send_command("write", "f", serde_json::json!(b"B".to_vec())).await;

    a.observe(&b);
    b.observe(&a);
    a.replication.reconcile_with_peer(&b.peer()).await.unwrap();
    b.replication.reconcile_with_peer(&a.peer()).await.unwrap();

    let ra = a.metadata.get("f").unwrap().unwrap();
    let rb = b.metadata.get("f").unwrap().unwrap();
    assert_eq!(ra.originating_node_id, "node-b");
    assert_eq!(rb.originating_node_id, "node-b");
    assert_eq!(ra.version, rb.version);
    assert_eq!(ra.checksum, sha256_hex(b"B"));
    assert_eq!(a.local.read("f").await.unwrap(), b"B");
    assert_eq!(b.local.read("f").await.unwrap(), b"B");
}

// S4 — conflict, tie-break by origin: identical timestamps, so the
// lexicographically greater origin must win deterministically on both sides.
#[tokio::test]
async fn s4_conflict_tie_breaks_by_origin() {
    let a = spawn_node("node-a").await;
    let b = spawn_node("node-z").await;

    let shared_ts = now_secs();
    let record_a = FileRecord {
        filepath: "tie.txt".to_string(),
        checksum: sha256_hex(b"from-a"),
        size: 6,
        version: 1,
        modified_time: shared_ts,
        created_time: shared_ts,
        originating_node_id: "node-a".to_string(),
        last_operation: FileOperation::Modify,
        is_deleted: false,
    };
    let record_b = FileRecord {
        filepath: "tie.txt".to_string(),
        checksum: sha256_hex(b"from-z"),
        size: 6,
        version: 1,
        modified_time: shared_ts,
        created_time: shared_ts,
        originating_node_id: "node-z".to_string(),
        last_operation: FileOperation::Modify,
        is_deleted: false,
    };
    a.local.write("tie.txt", b"from-a").await.unwrap();
    a.metadata.upsert(record_a).await.unwrap();
    b.local.write("tie.txt", b"from-z").await.unwrap();
    b.metadata.upsert(record_b).await.unwrap();

    a.observe(&b);
    b.observe(&a);
    a.replication.reconcile_with_peer(&b.peer()).await.unwrap();
    b.replication.reconcile_with_peer(&a.peer()).await.unwrap();

    let ra = a.metadata.get("tie.txt").unwrap().unwrap();
    let rb = b.metadata.get("tie.txt").unwrap().unwrap();
    // "node-z" > "node-a" lexicographically: node-z's record must win on both sides.
    assert_eq!(ra.originating_node_id, "node-z");
    assert_eq!(rb.originating_node_id, "node-z");
    assert_eq!(ra.version, rb.version);
    assert_eq!(a.local.read("tie.txt").await.unwrap(), b"from-z");
}

// S5 — corruption rejected: a sync_file whose body doesn't hash to the
// declared checksum must be refused, leaving no trace in metadata or body.
#[tokio::test]
async fn s5_corrupted_sync_file_is_rejected() {
    let b = spawn_node("node-b").await;

    let bogus = SyncFilePayload {
        record: FileRecord {
            filepath: "corrupt.txt".to_string(),
            checksum: sha256_hex(b"expected"),
            size: 7,
            version: 1,
            modified_time: now_secs(),
            created_time: now_secs(),
            originating_node_id: "node-a".to_string(),
            last_operation: FileOperation::Modify,
            is_deleted: false,
        },
        data: Some(b"actual-bytes-do-not-match".to_vec()),
    };
    let env = Envelope {
        kind: MessageType::Sync,
        action: "sync_file".to_string(),
        path: "corrupt.txt".to_string(),
        content: serde_json::to_value(&bogus).unwrap(),
        origin: "node-a".to_string(),
        timestamp: now_secs(),
        checksum: String::new(),
        sequence: None,
    };

    let resp = roundtrip(b.addr, env).await;
    assert_eq!(resp.content["success"], false);
    assert!(resp.content["message"].as_str().unwrap().contains("integrity"));
    assert!(b.metadata.get("corrupt.txt").unwrap().is_none());
    assert!(b.local.read("corrupt.txt").await.is_err());
}

// S6 — peer reaping: repeated heartbeat failures evict a dead peer, and that
// eviction resolves any outstanding send still addressed to it as failed.
#[tokio::test]
async fn s6_dead_peer_is_evicted_and_pending_sends_fail() {
    let a = spawn_node_with_retry("node-a", 4, 1).await;
    let b = spawn_node("node-b").await;
    a.observe(&b);

    let (tx, mut rx) = tokio::sync::mpsc::channel(8);
    let heartbeat = Arc::new(HeartbeatService::new(
        a.registry.clone(),
        "node-a".to_string(),
        2,
        1.0,
        tx,
        a.metrics.clone(),
    ));
    heartbeat.run_once(Default::default()).await;
    assert_eq!(a.registry.get("node-b").unwrap().liveness, Liveness::Alive);

    // Take node-b off the air, then queue a send to it. The first connect
    // attempt fails immediately and send_with_retry backs off ~1s before
    // retrying, leaving a window where the sync log entry is still Pending.
    b.stop().await;
    let record = FileRecord {
        filepath: "p.txt".to_string(),
        checksum: sha256_hex(b"pending"),
        size: 7,
        version: 1,
        modified_time: now_secs(),
        created_time: now_secs(),
        originating_node_id: "node-a".to_string(),
        last_operation: FileOperation::Modify,
        is_deleted: false,
    };
    a.replication.push(record, Some(b"pending".to_vec())).await;
    assert_eq!(a.metadata.pending_sync_count().unwrap(), 1);

    for _ in 0..2 {
        heartbeat.run_once(Default::default()).await;
    }
    let mut saw_eviction = false;
    while let Ok(event) = rx.try_recv() {
        if matches!(&event, meshfs::networking::heartbeat::LivenessEvent::Evicted(id) if id == "node-b") {
            saw_eviction = true;
        }
        a.replication.handle_liveness_event(event).await;
    }
    assert!(saw_eviction);

    assert!(a.registry.get("node-b").is_none());
    assert_eq!(a.metadata.pending_sync_count().unwrap(), 0);
}
