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

//! Message Router (spec §4.8): accepts inbound TCP connections, reads
//! exactly one framed message, dispatches by `(type, action)`, writes
//! exactly one framed response, and closes. Every connection carries a hard
//! read/write deadline.

use crate::core::codec::{now_secs, read_frame, validate_inbound, write_frame, CodecError};
use crate::core::error::HasKind;
use crate::core::types::{defaults, Envelope, MessageType, NodeStats};
use crate::monitoring::metrics::Metrics;
use crate::networking::commands::CommandHandler;
use crate::networking::peer_registry::PeerRegistry;
use crate::networking::replication::ReplicationEngine;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Dispatches every inbound connection to the subsystem that owns its action.
pub struct Router {
    commands: Arc<CommandHandler>,
    replication: Arc<ReplicationEngine>,
    registry: Arc<PeerRegistry>,
    node_id: String,
    max_frame_bytes: u32,
    connection_deadline: Duration,
    metrics: Arc<Metrics>,
}

impl Router {
    /// Build a new router.
    pub fn new(
        commands: Arc<CommandHandler>,
        replication: Arc<ReplicationEngine>,
        registry: Arc<PeerRegistry>,
        node_id: String,
        max_frame_bytes: u32,
        connection_deadline_secs: f64,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            commands,
            replication,
            registry,
            node_id,
            max_frame_bytes,
            connection_deadline: Duration::from_secs_f64(connection_deadline_secs.max(0.1)),
            metrics,
        })
    }

    /// Accept connections until `shutdown` signals true. Each connection is
    /// handled on its own task so a slow handler never blocks the accept loop.
    pub async fn run(self: Arc<Self>, listener: TcpListener, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            let router = Arc::clone(&self);
                            tokio::spawn(async move { router.handle_connection(stream, addr).await });
                        }
                        Err(e) => warn!(error = %e, "tcp accept failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("router accept loop shutting down");
                        return;
                    }
                }
            }
        }
    }

    async fn handle_connection(&self, mut stream: TcpStream, addr: SocketAddr) {
        self.metrics.connections_total.inc();
        let request = match timeout(
            self.connection_deadline,
            read_frame(&mut stream, self.max_frame_bytes),
        )
        .await
        {
            Ok(Ok(env)) => env,
            Ok(Err(e)) => {
                debug!(peer = %addr, error = %e, "malformed request");
                let _ = write_frame(&mut stream, &protocol_error(&self.node_id, &e)).await;
                return;
            }
            Err(_) => {
                self.metrics.connection_timeouts_total.inc();
                let _ = write_frame(&mut stream, &timeout_response(&self.node_id)).await;
                return;
            }
        };

        if let Err(e) = validate_inbound(&request, defaults::timestamp_skew_secs()) {
            debug!(peer = %addr, error = %e, "rejecting inbound message");
            let _ = write_frame(&mut stream, &rejected_response(&self.node_id, &e)).await;
            return;
        }

        let response = match timeout(self.connection_deadline, self.dispatch(request, addr)).await {
            Ok(env) => env,
            Err(_) => {
                self.metrics.connection_timeouts_total.inc();
                timeout_response(&self.node_id)
            }
        };

        if let Err(e) = timeout(self.connection_deadline, write_frame(&mut stream, &response)).await {
            debug!(peer = %addr, error = %e, "failed to write response before deadline");
        }
    }

    async fn dispatch(&self, env: Envelope, addr: SocketAddr) -> Envelope {
        match (env.kind, env.action.as_str()) {
            (MessageType::Command, "create" | "read" | "write" | "delete" | "mkdir" | "list") => {
                self.commands.handle(env).await
            }
            (MessageType::Sync, "sync_file") => self.replication.on_sync_file(&env).await,
            (MessageType::Sync, "sync_metadata") => self.replication.on_sync_metadata(&env),
            (MessageType::Sync, "request_file") => self.replication.on_request_file(&env).await,
            (MessageType::Heartbeat, "ping") => self.handle_ping(env, addr),
            _ => protocol_error(
                &self.node_id,
                &format!("no handler for ({:?}, {})", env.kind, env.action),
            ),
        }
    }

    fn handle_ping(&self, env: Envelope, addr: SocketAddr) -> Envelope {
        let stats: NodeStats = serde_json::from_value(env.content.clone()).unwrap_or_default();
        let (host, tcp_port) = self
            .registry
            .get(&env.origin)
            .map(|p| (p.host, p.tcp_port))
            .unwrap_or_else(|| (addr.ip().to_string(), 0));
        let (peer, is_new) = self
            .registry
            .observe(&env.origin, &host, tcp_port, now_secs(), String::new(), stats);
        if is_new {
            let replication = Arc::clone(&self.replication);
            tokio::spawn(async move {
                replication
                    .handle_liveness_event(crate::networking::heartbeat::LivenessEvent::BecameAlive(peer))
                    .await;
            });
        }
        Envelope {
            kind: MessageType::Response,
            action: "pong".to_string(),
            path: String::new(),
            content: serde_json::json!({}),
            origin: self.node_id.clone(),
            timestamp: now_secs(),
            checksum: String::new(),
            sequence: None,
        }
    }
}

fn rejected_response(node_id: &str, err: &CodecError) -> Envelope {
    Envelope {
        kind: MessageType::Response,
        action: "error".to_string(),
        path: String::new(),
        content: serde_json::json!({
            "success": false,
            "message": err.to_string(),
            "kind": err.kind().as_str(),
            "data": null,
        }),
        origin: node_id.to_string(),
        timestamp: now_secs(),
        checksum: String::new(),
        sequence: None,
    }
}

fn protocol_error(node_id: &str, detail: &dyn std::fmt::Display) -> Envelope {
    Envelope {
        kind: MessageType::Response,
        action: "error".to_string(),
        path: String::new(),
        content: serde_json::json!({
            "success": false,
            "message": format!("protocol: {detail}"),
            "data": null,
        }),
        origin: node_id.to_string(),
        timestamp: now_secs(),
        checksum: String::new(),
        sequence: None,
    }
}

fn timeout_response(node_id: &str) -> Envelope {
    Envelope {
        kind: MessageType::Response,
        action: "error".to_string(),
        path: String::new(),
        content: serde_json::json!({
            "success": false,
            "message": "timeout: connection deadline exceeded",
            "data": null,
        }),
        origin: node_id.to_string(),
        timestamp: now_secs(),
        checksum: String::new(),
        sequence: None,
    }
}
