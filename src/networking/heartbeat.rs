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

//! TCP ping/pong liveness probing (spec §4.6): once per `heartbeat_interval`,
//! open a fresh connection to each known peer, exchange `heartbeat/ping` and
//! `response/pong`, and close. Three consecutive failures (configurable)
//! transition a peer alive -> suspect -> dead and evict it, which in turn
//! cancels any outstanding replication work addressed to it.

use crate::core::codec::{now_secs, read_frame, write_frame};
use crate::core::types::{Envelope, Liveness, MessageType, NodeStats, Peer};
use crate::monitoring::metrics::Metrics;
use crate::networking::peer_registry::PeerRegistry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Emitted when a peer's liveness changes in a way downstream services must
/// react to.
#[derive(Clone, Debug)]
pub enum LivenessEvent {
    /// First successful heartbeat after being unknown, suspect, or dead:
    /// the Replication Engine should run reconnect-time reconciliation.
    BecameAlive(Peer),
    /// The peer was evicted after exhausting its failure budget: the
    /// Replication Engine must cancel outstanding sends to it.
    Evicted(String),
}

/// Runs the periodic ping/pong loop against every peer in the registry.
pub struct HeartbeatService {
    registry: Arc<PeerRegistry>,
    node_id: String,
    failure_threshold: u32,
    connection_deadline: Duration,
    failures: Mutex<HashMap<String, u32>>,
    events: tokio::sync::mpsc::Sender<LivenessEvent>,
    metrics: Arc<Metrics>,
}

impl HeartbeatService {
    /// Build a new service. `events` receives liveness transitions for the
    /// Replication Engine to react to.
    pub fn new(
        registry: Arc<PeerRegistry>,
        node_id: String,
        failure_threshold: u32,
        connection_deadline_secs: f64,
        events: tokio::sync::mpsc::Sender<LivenessEvent>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            registry,
            node_id,
            failure_threshold,
            connection_deadline: Duration::from_secs_f64(connection_deadline_secs.max(0.1)),
            failures: Mutex::new(HashMap::new()),
            events,
            metrics,
        }
    }

    /// Run one round: ping every currently known peer concurrently.
    pub async fn run_once(&self, stats: NodeStats) {
        let peers = self.registry.snapshot();
        let mut joins = Vec::with_capacity(peers.len());
        for peer in peers {
            let stats = stats.clone();
            joins.push(self.ping_one(peer, stats));
        }
        futures::future::join_all(joins).await;
        let (alive, suspect) = self.registry.liveness_counts();
        self.metrics.peers_alive.set(alive as i64);
        self.metrics.peers_suspect.set(suspect as i64);
    }

    /// Loop forever on `interval_secs`, until `shutdown` signals true.
    pub async fn run(
        &self,
        interval_secs: f64,
        stats_source: impl Fn() -> NodeStats,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(Duration::from_secs_f64(interval_secs.max(0.1)));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_once(stats_source()).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("heartbeat service shutting down");
                        return;
                    }
                }
            }
        }
    }

    async fn ping_one(&self, peer: Peer, stats: NodeStats) {
        let was_alive = peer.liveness == Liveness::Alive;
        match timeout(self.connection_deadline, self.ping(&peer, stats)).await {
            Ok(Ok(())) => {
                self.failures.lock().await.remove(&peer.node_id);
                self.registry.set_liveness(&peer.node_id, Liveness::Alive);
                if !was_alive {
                    let updated = self.registry.get(&peer.node_id).unwrap_or(peer);
                    let _ = self.events.send(LivenessEvent::BecameAlive(updated)).await;
                }
            }
            Ok(Err(e)) => {
                debug!(peer = %peer.node_id, error = %e, "heartbeat failed");
                self.record_failure(&peer.node_id).await;
            }
            Err(_) => {
                debug!(peer = %peer.node_id, "heartbeat timed out");
                self.record_failure(&peer.node_id).await;
            }
        }
    }

    async fn record_failure(&self, node_id: &str) {
        let mut guard = self.failures.lock().await;
        let count = guard.entry(node_id.to_string()).or_insert(0);
        *count += 1;
        if *count >= self.failure_threshold {
            guard.remove(node_id);
            drop(guard);
            self.registry.mark_dead(node_id);
            self.metrics.peers_evicted_total.inc();
            warn!(peer = %node_id, "peer evicted after repeated heartbeat failures");
            let _ = self.events.send(LivenessEvent::Evicted(node_id.to_string())).await;
        } else {
            self.registry.set_liveness(node_id, Liveness::Suspect);
        }
    }

    async fn ping(&self, peer: &Peer, stats: NodeStats) -> std::io::Result<()> {
        let mut stream = TcpStream::connect((peer.host.as_str(), peer.tcp_port)).await?;
        let ping = Envelope {
            kind: MessageType::Heartbeat,
            action: "ping".to_string(),
            path: String::new(),
            content: serde_json::to_value(&stats).unwrap_or_default(),
            origin: self.node_id.clone(),
            timestamp: now_secs(),
            checksum: String::new(),
            sequence: None,
        };
        write_frame(&mut stream, &ping)
            .await
            .map_err(to_io_error)?;
        let pong = read_frame(&mut stream, 1024 * 1024)
            .await
            .map_err(to_io_error)?;
        if !matches!(pong.kind, MessageType::Response) || pong.action != "pong" {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "expected response/pong",
            ));
        }
        info!(peer = %peer.node_id, "heartbeat round trip succeeded");
        Ok(())
    }
}

fn to_io_error(e: crate::core::codec::CodecError) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::NodeStats;
    use tokio::net::TcpListener;

    async fn respond_pong_once(listener: TcpListener) {
        let (mut stream, _) = listener.accept().await.unwrap();
        let _req = read_frame(&mut stream, 1024 * 1024).await.unwrap();
        let pong = Envelope {
            kind: MessageType::Response,
            action: "pong".to_string(),
            path: String::new(),
            content: serde_json::json!({}),
            origin: "node-b".to_string(),
            timestamp: now_secs(),
            checksum: String::new(),
            sequence: None,
        };
        write_frame(&mut stream, &pong).await.unwrap();
    }

    #[tokio::test]
    async fn successful_ping_keeps_peer_alive_and_resets_failures() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(respond_pong_once(listener));

        let registry = Arc::new(PeerRegistry::new());
        registry.observe(
            "node-b",
            &addr.ip().to_string(),
            addr.port(),
            now_secs(),
            "0.1.0".into(),
            NodeStats::default(),
        );
        let (tx, _rx) = tokio::sync::mpsc::channel(8);
        let metrics = Arc::new(Metrics::new().unwrap());
        let service = HeartbeatService::new(registry.clone(), "node-a".into(), 3, 5.0, tx, metrics);
        service.run_once(NodeStats::default()).await;

        assert_eq!(registry.get("node-b").unwrap().liveness, Liveness::Alive);
    }

    #[tokio::test]
    async fn repeated_failures_evict_and_emit_event() {
        let registry = Arc::new(PeerRegistry::new());
        // Port 1 is reserved and nothing listens there; connect will fail fast.
        registry.observe("node-b", "127.0.0.1", 1, now_secs(), "0.1.0".into(), NodeStats::default());
        let (tx, mut rx) = tokio::sync::mpsc::channel(8);
        let metrics = Arc::new(Metrics::new().unwrap());
        let service = HeartbeatService::new(registry.clone(), "node-a".into(), 2, 1.0, tx, metrics);

        service.run_once(NodeStats::default()).await;
        assert_eq!(registry.get("node-b").unwrap().liveness, Liveness::Suspect);

        service.run_once(NodeStats::default()).await;
        assert!(registry.get("node-b").is_none());

        let mut saw_eviction = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, LivenessEvent::Evicted(id) if id == "node-b") {
                saw_eviction = true;
            }
        }
        assert!(saw_eviction);
    }
}
