// Copyright (c) 2026 Meshfs
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! UDP broadcast discovery (spec §4.5): a periodic announce sender and a
//! concurrent listener that feeds the Peer Registry.

use crate::core::codec::{decode_datagram, encode_datagram, now_secs, validate_inbound};
use crate::core::types::{defaults, Envelope, MessageType};
use crate::networking::heartbeat::LivenessEvent;
use crate::networking::peer_registry::PeerRegistry;
use crate::networking::replication::ReplicationEngine;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::time::{interval, Duration};
use tracing::{debug, warn};

/// Binds the discovery UDP socket with broadcast enabled.
pub async fn bind(bind_address: &str, discovery_port: u16) -> std::io::Result<UdpSocket> {
    let socket = UdpSocket::bind((bind_address, discovery_port)).await?;
    socket.set_broadcast(true)?;
    Ok(socket)
}

/// Periodically broadcast a `discovery/announce` declaring `node_id`,
/// `tcp_port`, and this build's version, until `shutdown` resolves.
pub async fn run_announcer(
    socket: Arc<UdpSocket>,
    node_id: String,
    tcp_port: u16,
    discovery_port: u16,
    interval_secs: f64,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let broadcast_addr: SocketAddr = ([255, 255, 255, 255], discovery_port).into();
    let mut ticker = interval(Duration::from_secs_f64(interval_secs.max(0.1)));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let env = Envelope {
                    kind: MessageType::Discovery,
                    action: "announce".to_string(),
                    path: String::new(),
                    content: serde_json::json!({
                        "port": tcp_port,
                        "version": env!("CARGO_PKG_VERSION"),
                    }),
                    origin: node_id.clone(),
                    timestamp: now_secs(),
                    checksum: String::new(),
                    sequence: None,
                };
                match encode_datagram(&env) {
                    Ok(bytes) => {
                        if let Err(e) = socket.send_to(&bytes, broadcast_addr).await {
                            warn!(error = %e, "discovery announce send failed");
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to encode discovery announce"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!("discovery announcer shutting down");
                    return;
                }
            }
        }
    }
}

/// Listen for inbound `discovery/announce` datagrams and feed `observe` on
/// the Peer Registry. Datagrams whose `origin` equals `self_node_id` are
/// ignored.
pub async fn run_listener(
    socket: Arc<UdpSocket>,
    self_node_id: String,
    registry: Arc<PeerRegistry>,
    replication: Arc<ReplicationEngine>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        tokio::select! {
            recv = socket.recv_from(&mut buf) => {
                match recv {
                    Ok((len, from)) => handle_datagram(&buf[..len], from, &self_node_id, &registry, &replication),
                    Err(e) => warn!(error = %e, "discovery recv failed"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!("discovery listener shutting down");
                    return;
                }
            }
        }
    }
}

fn handle_datagram(
    bytes: &[u8],
    from: SocketAddr,
    self_node_id: &str,
    registry: &PeerRegistry,
    replication: &Arc<ReplicationEngine>,
) {
    let env = match decode_datagram(bytes) {
        Ok(env) => env,
        Err(e) => {
            debug!(error = %e, "dropping malformed discovery datagram");
            return;
        }
    };
    if env.origin == self_node_id {
        return;
    }
    if !matches!(env.kind, MessageType::Discovery) || env.action != "announce" {
        debug!(kind = ?env.kind, action = %env.action, "dropping unexpected discovery payload");
        return;
    }
    if let Err(e) = validate_inbound(&env, defaults::timestamp_skew_secs()) {
        debug!(error = %e, origin = %env.origin, "dropping invalid discovery announce");
        return;
    }
    let tcp_port = env
        .content
        .get("port")
        .and_then(|v| v.as_u64())
        .and_then(|p| u16::try_from(p).ok());
    let version = env
        .content
        .get("version")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let Some(tcp_port) = tcp_port else {
        debug!("discovery announce missing port");
        return;
    };
    let (peer, is_new) = registry.observe(
        &env.origin,
        &from.ip().to_string(),
        tcp_port,
        now_secs(),
        version,
        Default::default(),
    );
    if is_new {
        let replication = Arc::clone(replication);
        tokio::spawn(async move {
            replication.handle_liveness_event(LivenessEvent::BecameAlive(peer)).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::local::LocalStore;
    use crate::core::store::metadata::MetadataStore;
    use crate::core::types::NodeStats;
    use crate::monitoring::metrics::Metrics;
    use crate::networking::replication::ReplicationConfig;
    use std::time::Duration as StdDuration;

    async fn test_replication() -> (tempfile::TempDir, Arc<ReplicationEngine>) {
        let dir = tempfile::tempdir().unwrap();
        let metadata = Arc::new(MetadataStore::open(dir.path().join("metadata.db")).await.unwrap());
        let local = Arc::new(LocalStore::open(dir.path().join("root")).await.unwrap());
        let registry = Arc::new(PeerRegistry::new());
        let metrics = Arc::new(Metrics::new().unwrap());
        let replication = ReplicationEngine::new(
            metadata,
            local,
            registry,
            "self-node".to_string(),
            ReplicationConfig {
                batch_size: 10,
                verify_checksums: true,
                retry_attempts: 1,
                retry_base_secs: 1,
                connection_deadline: StdDuration::from_secs(1),
            },
            metrics,
        );
        (dir, replication)
    }

    #[tokio::test]
    async fn self_origin_datagram_is_ignored() {
        let registry = PeerRegistry::new();
        let (_dir, replication) = test_replication().await;
        let env = Envelope {
            kind: MessageType::Discovery,
            action: "announce".to_string(),
            path: String::new(),
            content: serde_json::json!({"port": 9000, "version": "0.1.0"}),
            origin: "self-node".to_string(),
            timestamp: now_secs(),
            checksum: String::new(),
            sequence: None,
        };
        let bytes = encode_datagram(&env).unwrap();
        handle_datagram(&bytes, "127.0.0.1:9050".parse().unwrap(), "self-node", &registry, &replication);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn peer_datagram_populates_registry() {
        let registry = PeerRegistry::new();
        let (_dir, replication) = test_replication().await;
        let env = Envelope {
            kind: MessageType::Discovery,
            action: "announce".to_string(),
            path: String::new(),
            content: serde_json::json!({"port": 9001, "version": "0.1.0"}),
            origin: "node-b".to_string(),
            timestamp: now_secs(),
            checksum: String::new(),
            sequence: None,
        };
        let bytes = encode_datagram(&env).unwrap();
        handle_datagram(&bytes, "127.0.0.1:9050".parse().unwrap(), "self-node", &registry, &replication);
        let peer = registry.get("node-b").unwrap();
        assert_eq!(peer.tcp_port, 9001);
        assert_eq!(peer.stats, NodeStats::default());
    }
}
