#![forbid(unsafe_code)]

//! Framing, checksum, and clock-skew guarantees at the wire boundary
//! (spec §4.1), exercised through a real router over loopback TCP.

mod support;

use meshfs::core::codec::{now_secs, validate_inbound};
use meshfs::core::types::{Envelope, MessageType};
use support::{roundtrip, spawn_node};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

fn sample(path: &str) -> Envelope {
    Envelope {
        kind: MessageType::Command,
        action: "create".to_string(),
        path: path.to_string(),
        content: serde_json::json!({}),
        origin: "node-a".to_string(),
        timestamp: now_secs(),
        checksum: String::new(),
        sequence: None,
    }
}

#[tokio::test]
async fn well_formed_request_round_trips_through_the_router() {
    let node = spawn_node("node-a").await;
    let resp = roundtrip(node.addr, sample("a.txt")).await;
    assert_eq!(resp.content["success"], true);
}

#[tokio::test]
async fn tampered_checksum_is_rejected_without_mutating_state() {
    let node = spawn_node("node-a").await;

    // Build the frame by hand so the checksum the server sees is wrong,
    // bypassing write_frame's automatic seal().
    let mut env = sample("tampered.txt");
    env.checksum = "0000000000000000".to_string();
    let body = serde_json::to_vec(&env).unwrap();
    let mut stream = TcpStream::connect(node.addr).await.unwrap();
    stream.write_all(&(body.len() as u32).to_be_bytes()).await.unwrap();
    stream.write_all(&body).await.unwrap();

    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await.unwrap();
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut resp_body = vec![0u8; len];
    stream.read_exact(&mut resp_body).await.unwrap();
    let resp: Envelope = serde_json::from_slice(&resp_body).unwrap();

    assert_eq!(resp.content["success"], false);
    assert_eq!(resp.content["kind"], "integrity");
    assert!(node.metadata.get("tampered.txt").unwrap().is_none());
}

#[tokio::test]
async fn stale_timestamp_is_rejected() {
    let node = spawn_node("node-a").await;
    let mut env = sample("old.txt");
    env.timestamp = now_secs() - 10_000.0;
    meshfs::core::codec::seal(&mut env).unwrap();
    let body = serde_json::to_vec(&env).unwrap();
    let mut stream = TcpStream::connect(node.addr).await.unwrap();
    stream.write_all(&(body.len() as u32).to_be_bytes()).await.unwrap();
    stream.write_all(&body).await.unwrap();

    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await.unwrap();
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut resp_body = vec![0u8; len];
    stream.read_exact(&mut resp_body).await.unwrap();
    let resp: Envelope = serde_json::from_slice(&resp_body).unwrap();

    assert_eq!(resp.content["success"], false);
    assert_eq!(resp.content["kind"], "stale");
}

#[test]
fn validate_inbound_catches_both_failure_modes() {
    let mut env = sample("x.txt");
    meshfs::core::codec::seal(&mut env).unwrap();
    assert!(validate_inbound(&env, 300.0).is_ok());

    let mut tampered = env.clone();
    tampered.path = "y.txt".to_string();
    assert!(validate_inbound(&tampered, 300.0).is_err());

    let mut stale = env.clone();
    stale.timestamp -= 10_000.0;
    meshfs::core::codec::seal(&mut stale).unwrap();
    assert!(validate_inbound(&stale, 300.0).is_err());
}
