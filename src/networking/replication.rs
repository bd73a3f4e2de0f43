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

//! Replication Engine (spec §4.7): local-change fan-out with retry/backoff,
//! inbound sync application with checksum verification and last-writer-wins
//! conflict resolution, and reconnect-time reconciliation.

use crate::core::codec::{now_secs, read_frame, write_frame};
use crate::core::store::local::LocalStore;
use crate::core::store::metadata::MetadataStore;
use crate::core::types::{
    Envelope, FileOperation, FileRecord, MessageType, MetadataSnapshot, Peer, SyncStatus,
};
use crate::monitoring::metrics::Metrics;
use crate::networking::heartbeat::LivenessEvent;
use crate::networking::peer_registry::PeerRegistry;
use ring::digest;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// The body carried by a `sync/sync_file` message (spec §6).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncFilePayload {
    /// The record describing this version.
    pub record: FileRecord,
    /// The file body, absent for deletes and for directories.
    pub data: Option<Vec<u8>>,
}

/// Tuning knobs the engine needs from `sync.*` (spec §4.8).
#[derive(Clone, Debug)]
pub struct ReplicationConfig {
    /// In-flight cap for reconnect-time file pulls.
    pub batch_size: usize,
    /// Whether to verify checksums on inbound sync bodies.
    pub verify_checksums: bool,
    /// Outbound retry budget.
    pub retry_attempts: u32,
    /// Base backoff seconds, doubling per attempt.
    pub retry_base_secs: u64,
    /// Hard per-connection deadline.
    pub connection_deadline: Duration,
}

struct PendingSend {
    handle: JoinHandle<()>,
    sync_log_id: u64,
}

/// Owns outbound fan-out, inbound application, and reconciliation.
pub struct ReplicationEngine {
    metadata: Arc<MetadataStore>,
    local: Arc<LocalStore>,
    registry: Arc<PeerRegistry>,
    node_id: String,
    config: ReplicationConfig,
    pending_by_peer: Mutex<HashMap<String, Vec<PendingSend>>>,
    metrics: Arc<Metrics>,
}

impl ReplicationEngine {
    /// Build a new engine.
    pub fn new(
        metadata: Arc<MetadataStore>,
        local: Arc<LocalStore>,
        registry: Arc<PeerRegistry>,
        node_id: String,
        config: ReplicationConfig,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            metadata,
            local,
            registry,
            node_id,
            config,
            pending_by_peer: Mutex::new(HashMap::new()),
            metrics,
        })
    }

    // -----------------------------------------------------------------
    // (a) Local-change propagation
    // -----------------------------------------------------------------

    /// Fan out a local mutation to every currently-alive peer. Each
    /// per-peer send is retried with exponential backoff and resolves its
    /// own `SyncLogEntry` independently; this call does not wait for any
    /// of them.
    pub async fn push(self: &Arc<Self>, record: FileRecord, body: Option<Vec<u8>>) {
        let peers = self.registry.alive_snapshot();
        for peer in peers {
            let entry = crate::core::types::SyncLogEntry {
                id: 0,
                sync_id: uuid::Uuid::new_v4().to_string(),
                source_node: self.node_id.clone(),
                target_node: peer.node_id.clone(),
                filepath: record.filepath.clone(),
                action: record.last_operation,
                timestamp: now_secs(),
                status: SyncStatus::Pending,
                error_message: None,
            };
            let appended = match self.metadata.append_sync(entry).await {
                Ok(e) => e,
                Err(e) => {
                    warn!(error = %e, "failed to append sync log entry");
                    continue;
                }
            };
            let engine = Arc::clone(self);
            let record = record.clone();
            let body = body.clone();
            let peer_id = peer.node_id.clone();
            let sync_log_id = appended.id;
            let handle = tokio::spawn(async move {
                engine.send_with_retry(peer, record, body, sync_log_id).await;
            });
            self.pending_by_peer
                .lock()
                .await
                .entry(peer_id)
                .or_default()
                .push(PendingSend { handle, sync_log_id });
        }
    }

    async fn send_with_retry(
        &self,
        peer: Peer,
        record: FileRecord,
        body: Option<Vec<u8>>,
        sync_log_id: u64,
    ) {
        for attempt in 0..self.config.retry_attempts {
            match self.send_sync_file(&peer, &record, &body).await {
                Ok(()) => {
                    let _ = self
                        .metadata
                        .resolve_sync(sync_log_id, SyncStatus::Success, None)
                        .await;
                    self.metrics.sync_success_total.inc();
                    self.forget_pending(&peer.node_id, sync_log_id).await;
                    return;
                }
                Err(e) => {
                    if attempt + 1 >= self.config.retry_attempts {
                        let _ = self
                            .metadata
                            .resolve_sync(sync_log_id, SyncStatus::Failed, Some(e.to_string()))
                            .await;
                        self.metrics.sync_failed_total.inc();
                        self.forget_pending(&peer.node_id, sync_log_id).await;
                        return;
                    }
                    let backoff = Duration::from_secs(self.config.retry_base_secs << attempt);
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    async fn forget_pending(&self, peer_id: &str, sync_log_id: u64) {
        let mut guard = self.pending_by_peer.lock().await;
        if let Some(list) = guard.get_mut(peer_id) {
            list.retain(|p| p.sync_log_id != sync_log_id);
        }
    }

    async fn send_sync_file(
        &self,
        peer: &Peer,
        record: &FileRecord,
        body: &Option<Vec<u8>>,
    ) -> std::io::Result<()> {
        let payload = SyncFilePayload {
            record: record.clone(),
            data: body.clone(),
        };
        let env = Envelope {
            kind: MessageType::Sync,
            action: "sync_file".to_string(),
            path: record.filepath.clone(),
            content: serde_json::to_value(&payload).map_err(to_io_error)?,
            origin: self.node_id.clone(),
            timestamp: now_secs(),
            checksum: String::new(),
            sequence: None,
        };
        let resp = tokio::time::timeout(
            self.config.connection_deadline,
            self.roundtrip(peer, env),
        )
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "sync_file timed out"))??;
        if resp.content.get("success").and_then(|v| v.as_bool()) == Some(true) {
            Ok(())
        } else {
            Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                resp.content
                    .get("message")
                    .and_then(|v| v.as_str())
                    .unwrap_or("peer rejected sync_file")
                    .to_string(),
            ))
        }
    }

    async fn roundtrip(&self, peer: &Peer, env: Envelope) -> std::io::Result<Envelope> {
        let mut stream = TcpStream::connect((peer.host.as_str(), peer.tcp_port)).await?;
        write_frame(&mut stream, &env).await.map_err(to_io_error)?;
        read_frame(&mut stream, 64 * 1024 * 1024)
            .await
            .map_err(to_io_error)
    }

    /// React to a heartbeat liveness transition: cancel outstanding sends to
    /// an evicted peer, or kick off reconciliation against a newly alive one.
    pub async fn handle_liveness_event(self: &Arc<Self>, event: LivenessEvent) {
        match event {
            LivenessEvent::Evicted(node_id) => {
                let pending = self.pending_by_peer.lock().await.remove(&node_id);
                if let Some(pending) = pending {
                    for p in pending {
                        p.handle.abort();
                        let _ = self
                            .metadata
                            .resolve_sync(p.sync_log_id, SyncStatus::Failed, Some("peer evicted".to_string()))
                            .await;
                        self.metrics.sync_failed_total.inc();
                    }
                }
            }
            LivenessEvent::BecameAlive(peer) => {
                let engine = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(e) = engine.reconcile_with_peer(&peer).await {
                        warn!(peer = %peer.node_id, error = %e, "reconciliation failed");
                    }
                });
            }
        }
    }

    // -----------------------------------------------------------------
    // (b) Inbound application
    // -----------------------------------------------------------------

    /// Handle an inbound `sync/sync_file` and return the response to write back.
    pub async fn on_sync_file(&self, env: &Envelope) -> Envelope {
        let payload: SyncFilePayload = match serde_json::from_value(env.content.clone()) {
            Ok(p) => p,
            Err(e) => return error_response(&self.node_id, "sync_file", "protocol", &e.to_string()),
        };
        match self.apply_sync_file(payload).await {
            Ok(()) => ok_response(&self.node_id, "sync_file", "applied", serde_json::Value::Null),
            Err(e) => error_response(&self.node_id, "sync_file", e.kind(), &e.message),
        }
    }

    async fn apply_sync_file(&self, payload: SyncFilePayload) -> Result<(), ApplyError> {
        if self.config.verify_checksums {
            if let Some(data) = &payload.data {
                let actual = hex::encode(digest::digest(&digest::SHA256, data).as_ref());
                if actual != payload.record.checksum {
                    self.metrics.sync_integrity_errors_total.inc();
                    return Err(ApplyError::integrity("checksum mismatch on sync_file body"));
                }
            }
        }

        let filepath = payload.record.filepath.clone();
        let existing = self
            .metadata
            .get(&filepath)
            .map_err(|e| ApplyError::write_failed(e.to_string()))?;

        let (decided, body_from_remote) = match &existing {
            None => (payload.record.clone(), true),
            Some(existing) if payload.record.version > existing.version => {
                (payload.record.clone(), true)
            }
            Some(existing) => {
                let winner = resolve_conflict(existing, &payload.record);
                self.metrics.conflicts_resolved_total.inc();
                let remote_wins = winner.originating_node_id == payload.record.originating_node_id
                    && winner.modified_time == payload.record.modified_time;
                (winner, remote_wins)
            }
        };

        if body_from_remote && decided.last_operation != FileOperation::Delete {
            if let Some(data) = &payload.data {
                let backup = self.local.read(&filepath).await.ok();
                if let Err(e) = self.local.write(&filepath, data).await {
                    return Err(ApplyError::write_failed(e.to_string()));
                }
                let actual_hash = self
                    .local
                    .hash(&filepath)
                    .await
                    .map_err(|e| ApplyError::write_failed(e.to_string()))?;
                if actual_hash != decided.checksum {
                    if let Some(backup) = backup {
                        let _ = self.local.write(&filepath, &backup).await;
                    } else {
                        let _ = self.local.delete(&filepath).await;
                    }
                    return Err(ApplyError::write_failed("re-verified hash mismatch after write"));
                }
            } else if decided.last_operation == FileOperation::Mkdir {
                self.local
                    .mkdir(&filepath)
                    .await
                    .map_err(|e| ApplyError::write_failed(e.to_string()))?;
            }
        } else if decided.last_operation == FileOperation::Delete && body_from_remote {
            let _ = self.local.delete(&filepath).await;
        }

        self.metadata
            .upsert(decided)
            .await
            .map_err(|e| ApplyError::write_failed(e.to_string()))?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // (c) Reconnect-time reconciliation
    // -----------------------------------------------------------------

    /// Handle an inbound `sync/sync_metadata`: respond with our own snapshot.
    pub fn on_sync_metadata(&self, _env: &Envelope) -> Envelope {
        let snapshot = self.metadata.snapshot().unwrap_or_default();
        ok_response(
            &self.node_id,
            "sync_metadata",
            "snapshot",
            serde_json::to_value(snapshot).unwrap_or_default(),
        )
    }

    /// Handle an inbound `sync/request_file`: respond with a `sync_file`-shaped payload.
    pub async fn on_request_file(&self, env: &Envelope) -> Envelope {
        let record = match self.metadata.get(&env.path) {
            Ok(Some(r)) => r,
            Ok(None) => return error_response(&self.node_id, "request_file", "not_found", "no such filepath"),
            Err(e) => return error_response(&self.node_id, "request_file", "write_failed", &e.to_string()),
        };
        let data = if record.is_deleted {
            None
        } else {
            self.local.read(&env.path).await.ok()
        };
        let payload = SyncFilePayload { record, data };
        ok_response(
            &self.node_id,
            "request_file",
            "file",
            serde_json::to_value(payload).unwrap_or_default(),
        )
    }

    /// Exchange `sync/sync_metadata` with `peer` and pull every filepath
    /// where they hold a strictly higher version, rate-limited by `batch_size`.
    pub async fn reconcile_with_peer(&self, peer: &Peer) -> std::io::Result<()> {
        let local_snapshot = self.metadata.snapshot().unwrap_or_default();
        let req = Envelope {
            kind: MessageType::Sync,
            action: "sync_metadata".to_string(),
            path: String::new(),
            content: serde_json::to_value(&local_snapshot).map_err(to_io_error)?,
            origin: self.node_id.clone(),
            timestamp: now_secs(),
            checksum: String::new(),
            sequence: None,
        };
        let resp = self.roundtrip(peer, req).await?;
        let peer_snapshot: MetadataSnapshot = resp
            .content
            .get("data")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(to_io_error)?
            .unwrap_or_default();

        // A path is worth pulling whenever the peer's view of it differs from
        // ours at all, not only when the peer is strictly ahead: two nodes
        // can independently mutate the same filepath to the same version
        // while partitioned, and apply_sync_file's conflict rule (spec
        // §4.7(d)) is what actually decides the winner once we have both
        // sides' records to compare.
        let stale_paths: Vec<String> = peer_snapshot
            .iter()
            .filter(|(path, peer_entry)| {
                local_snapshot.get(*path).map(|e| e != *peer_entry).unwrap_or(true)
            })
            .map(|(path, _)| path.clone())
            .collect();

        info!(peer = %peer.node_id, count = stale_paths.len(), "reconciling stale filepaths");

        let semaphore = Arc::new(Semaphore::new(self.config.batch_size.max(1)));
        let mut joins = Vec::with_capacity(stale_paths.len());
        for path in stale_paths {
            let permit = Arc::clone(&semaphore).acquire_owned().await.map_err(to_io_error)?;
            let peer = peer.clone();
            let deadline = self.config.connection_deadline;
            let node_id = self.node_id.clone();
            joins.push(async move {
                let _permit = permit;
                request_and_apply(peer, path, deadline, node_id).await
            });
        }
        let results: Vec<SyncFilePayload> = futures::future::join_all(joins)
            .await
            .into_iter()
            .filter_map(|r| r.ok())
            .collect();
        for payload in results {
            if let Err(e) = self.apply_sync_file(payload).await {
                warn!(error = %e.message, "failed to apply pulled file during reconciliation");
            }
        }
        Ok(())
    }

    /// Periodically run full `sync_metadata` reconciliation against every
    /// alive peer, bounding the staleness invariant (spec §8 invariant 3).
    pub async fn run_periodic_resync(
        self: Arc<Self>,
        interval_secs: f64,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(Duration::from_secs_f64(interval_secs.max(1.0)));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for peer in self.registry.alive_snapshot() {
                        let engine = Arc::clone(&self);
                        tokio::spawn(async move {
                            if let Err(e) = engine.reconcile_with_peer(&peer).await {
                                warn!(peer = %peer.node_id, error = %e, "periodic resync failed");
                            }
                        });
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}

/// Fetch one file over a fresh connection and return its payload for the
/// caller to apply; run as an independent future so failures don't abort
/// sibling pulls in the same reconciliation round.
async fn request_and_apply(
    peer: Peer,
    path: String,
    deadline: Duration,
    node_id: String,
) -> std::io::Result<SyncFilePayload> {
    let req = Envelope {
        kind: MessageType::Sync,
        action: "request_file".to_string(),
        path: path.clone(),
        content: serde_json::Value::Null,
        origin: node_id,
        timestamp: now_secs(),
        checksum: String::new(),
        sequence: None,
    };
    let mut stream = tokio::time::timeout(
        deadline,
        TcpStream::connect((peer.host.as_str(), peer.tcp_port)),
    )
    .await
    .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"))??;
    write_frame(&mut stream, &req).await.map_err(to_io_error)?;
    let resp = read_frame(&mut stream, 64 * 1024 * 1024)
        .await
        .map_err(to_io_error)?;
    let data = resp
        .content
        .get("data")
        .cloned()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "missing payload"))?;
    serde_json::from_value(data).map_err(to_io_error)
}

/// Deterministic last-writer-wins resolution (spec §4.7(d)): timestamp
/// breaks the tie first, then lexicographically greater `originating_node_id`.
/// The winner's version is bumped above both inputs.
pub fn resolve_conflict(local: &FileRecord, remote: &FileRecord) -> FileRecord {
    let mut winner = if remote.modified_time > local.modified_time {
        remote.clone()
    } else if remote.modified_time < local.modified_time {
        local.clone()
    } else if remote.originating_node_id > local.originating_node_id {
        remote.clone()
    } else {
        local.clone()
    };
    winner.version = local.version.max(remote.version) + 1;
    winner
}

struct ApplyError {
    kind: &'static str,
    message: String,
}

impl ApplyError {
    fn integrity(message: impl Into<String>) -> Self {
        Self {
            kind: "integrity",
            message: message.into(),
        }
    }
    fn write_failed(message: impl Into<String>) -> Self {
        Self {
            kind: "write_failed",
            message: message.into(),
        }
    }
    fn kind(&self) -> &'static str {
        self.kind
    }
}

fn to_io_error(e: impl std::fmt::Display) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, e.to_string())
}

fn ok_response(node_id: &str, action: &str, message: &str, data: serde_json::Value) -> Envelope {
    Envelope {
        kind: MessageType::Response,
        action: action.to_string(),
        path: String::new(),
        content: serde_json::json!({"success": true, "message": message, "data": data}),
        origin: node_id.to_string(),
        timestamp: now_secs(),
        checksum: String::new(),
        sequence: None,
    }
}

fn error_response(node_id: &str, action: &str, kind: &str, message: &str) -> Envelope {
    Envelope {
        kind: MessageType::Response,
        action: "error".to_string(),
        path: String::new(),
        content: serde_json::json!({"success": false, "message": format!("{action}: {kind}: {message}"), "data": null}),
        origin: node_id.to_string(),
        timestamp: now_secs(),
        checksum: String::new(),
        sequence: None,
    }
}
