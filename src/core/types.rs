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

//! Wire types, data model entities, and node configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ---------------------------------------------------------------------
// Data model (spec §3)
// ---------------------------------------------------------------------

/// The operation that produced a given [`FileRecord`] version.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOperation {
    /// New empty file or directory.
    Create,
    /// Body overwritten.
    Modify,
    /// Tombstoned.
    Delete,
    /// Directory created.
    Mkdir,
}

/// A record for one filepath in the Metadata Store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Root-relative, forward-slash-normalized path. Unique key.
    pub filepath: String,
    /// Full SHA-256 hex of the on-disk body; meaningless when `is_deleted`.
    pub checksum: String,
    /// Body size in bytes.
    pub size: u64,
    /// Strictly monotonic per-filepath version, starting at 1.
    pub version: u64,
    /// Seconds since UNIX epoch, as observed by the originating node.
    pub modified_time: f64,
    /// Seconds since UNIX epoch of the first create/mkdir for this filepath.
    pub created_time: f64,
    /// `node.name` of the node that produced this version.
    pub originating_node_id: String,
    /// The operation that produced this version.
    pub last_operation: FileOperation,
    /// Tombstone flag. When true the Local Store must not serve a body for this path.
    pub is_deleted: bool,
}

/// Outcome of one sync attempt (outbound or inbound), append-only.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Enqueued, not yet resolved.
    Pending,
    /// Peer accepted (or, for inbound, applied locally).
    Success,
    /// Exhausted its retry budget, or was rejected.
    Failed,
}

/// One row of the append-only sync log.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncLogEntry {
    /// Auto-incrementing row id, assigned by the Metadata Store on append.
    pub id: u64,
    /// Unique id for this sync attempt.
    pub sync_id: String,
    /// Node that originated the change.
    pub source_node: String,
    /// Node the change is being sent to (or was received from).
    pub target_node: String,
    /// Filepath this entry concerns.
    pub filepath: String,
    /// The operation being synced.
    pub action: FileOperation,
    /// Seconds since UNIX epoch when the entry was appended.
    pub timestamp: f64,
    /// Current resolution state.
    pub status: SyncStatus,
    /// Populated when `status == Failed`.
    pub error_message: Option<String>,
}

/// Peer liveness, driven by heartbeat round-trip success (spec §4.6).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    /// Heartbeats are succeeding.
    Alive,
    /// At least one heartbeat has failed, but not yet `dead`.
    Suspect,
    /// Evicted from the registry's point of view.
    Dead,
}

/// A snapshot of this node's own metadata-store totals, carried inside heartbeats
/// as the stats payload (spec §4.6; the process-statistics probe itself is out of
/// scope per spec §1 — this is the metadata-derived snapshot, not that probe).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeStats {
    /// Count of active (non-deleted) records.
    pub active_files: u64,
    /// Count of tombstoned records.
    pub deleted_files: u64,
    /// Count of sync log entries still pending.
    pub pending_syncs: u64,
    /// Reported node software version (from `CARGO_PKG_VERSION`/build info).
    pub version: String,
}

/// A peer known to this node, via discovery, static config, or an inbound message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Peer {
    /// `node.name` of the peer, once known; otherwise its address is used as a stand-in key.
    pub node_id: String,
    /// Host/IP the peer is reachable at.
    pub host: String,
    /// TCP port the peer's router listens on.
    pub tcp_port: u16,
    /// Seconds since UNIX epoch of the last datagram or successful heartbeat.
    pub last_seen: f64,
    /// Current liveness state.
    pub liveness: Liveness,
    /// Peer-reported software version string, if known.
    pub version_string: String,
    /// Most recent stats snapshot received from this peer.
    pub stats: NodeStats,
}

// ---------------------------------------------------------------------
// Wire envelope (spec §4.1, §6)
// ---------------------------------------------------------------------

/// Top-level message type, the first half of the (type, action) dispatch key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// A client (or peer — they share a surface) file operation request.
    Command,
    /// A replication message between peers.
    Sync,
    /// A liveness probe between peers.
    Heartbeat,
    /// A UDP LAN announcement.
    Discovery,
    /// A reply to any of the above.
    Response,
}

/// The literal wire shape: every message exchanged over TCP or UDP has exactly
/// these top-level fields. `content` is deliberately untyped here — the router's
/// `dispatch` match on `(kind, action)` is the tagged-variant boundary the
/// dynamic-JSON redesign (spec §9) calls for; unmatched pairs are a `protocol`
/// error rather than being passed through.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    /// Message type.
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Action within `kind`, e.g. `"create"`, `"sync_file"`, `"ping"`, `"announce"`.
    pub action: String,
    /// Filepath the message concerns; empty string when not applicable.
    #[serde(default)]
    pub path: String,
    /// Action-specific payload.
    #[serde(default)]
    pub content: serde_json::Value,
    /// `node.name` of the sender.
    pub origin: String,
    /// Sender wall-clock time, seconds since UNIX epoch.
    pub timestamp: f64,
    /// First 16 lowercase hex chars of SHA-256 over the canonical encoding of
    /// this message with `checksum` set to `""`. See [`crate::core::codec`].
    #[serde(default)]
    pub checksum: String,
    /// Optional ordering hint, used by chunked file transfer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
}

// ---------------------------------------------------------------------
// Configuration (spec §4.8)
// ---------------------------------------------------------------------

/// Root configuration, loaded from TOML (spec §4.8 enumerates every key below).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node identity.
    pub node: NodeSettings,
    /// Listen addresses and peer-liveness tuning.
    #[serde(default)]
    pub network: NetworkConfig,
    /// Local namespace root and metadata database location.
    pub filesystem: FilesystemConfig,
    /// Replication tuning.
    #[serde(default)]
    pub sync: SyncConfig,
    /// Static seed peers as `host:port` strings.
    #[serde(default)]
    pub peers: Vec<String>,
    /// Logging tuning.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// `node.*`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeSettings {
    /// Unique id for this node; used as `origin` on every message this node sends.
    pub name: String,
}

/// `network.*`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// TCP port the router listens on.
    #[serde(default = "defaults::tcp_port")]
    pub tcp_port: u16,
    /// UDP port discovery broadcasts/listens on.
    #[serde(default = "defaults::discovery_port")]
    pub discovery_port: u16,
    /// Interface to bind to; `0.0.0.0` for all interfaces.
    #[serde(default = "defaults::bind_address")]
    pub bind_address: String,
    /// Whether the Discovery Service runs at all.
    #[serde(default = "defaults::discovery_enabled")]
    pub discovery_enabled: bool,
    /// Seconds between heartbeat rounds.
    #[serde(default = "defaults::heartbeat_interval")]
    pub heartbeat_interval: f64,
    /// Seconds of silence before a peer is reaped.
    #[serde(default = "defaults::reconnect_timeout")]
    pub reconnect_timeout: f64,
    /// Hard per-connection read/write deadline, seconds.
    #[serde(default = "defaults::connection_deadline")]
    pub connection_deadline: f64,
    /// Maximum accepted frame length in bytes.
    #[serde(default = "defaults::max_frame_bytes")]
    pub max_frame_bytes: u32,
    /// Optional metrics HTTP listen address (`host:port`); disabled if absent.
    #[serde(default)]
    pub metrics_listen_addr: Option<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            tcp_port: defaults::tcp_port(),
            discovery_port: defaults::discovery_port(),
            bind_address: defaults::bind_address(),
            discovery_enabled: defaults::discovery_enabled(),
            heartbeat_interval: defaults::heartbeat_interval(),
            reconnect_timeout: defaults::reconnect_timeout(),
            connection_deadline: defaults::connection_deadline(),
            max_frame_bytes: defaults::max_frame_bytes(),
            metrics_listen_addr: None,
        }
    }
}

/// `filesystem.*`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FilesystemConfig {
    /// Root directory of the replicated namespace.
    pub root_path: String,
    /// Path to the metadata database.
    #[serde(default = "defaults::metadata_db")]
    pub metadata_db: String,
    /// Whether to run a full `sync_metadata` reconciliation against seed peers at startup.
    #[serde(default)]
    pub sync_on_startup: bool,
    /// Conflict resolution policy name. Only `"timestamp"` is currently implemented.
    #[serde(default = "defaults::conflict_resolution")]
    pub conflict_resolution: String,
}

/// `sync.*`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncConfig {
    /// In-flight cap for reconnect-time file pulls.
    #[serde(default = "defaults::batch_size")]
    pub batch_size: usize,
    /// Chunk size, in bytes, above which chunked file transfer is used.
    #[serde(default = "defaults::chunk_size")]
    pub chunk_size: usize,
    /// Whether to verify checksums on inbound sync bodies.
    #[serde(default = "defaults::verify_checksums")]
    pub verify_checksums: bool,
    /// Worker pool size for peer fan-out.
    #[serde(default = "defaults::max_sync_threads")]
    pub max_sync_threads: usize,
    /// Seconds between periodic full `sync_metadata` reconciliation rounds.
    #[serde(default = "defaults::resync_interval")]
    pub resync_interval: f64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: defaults::batch_size(),
            chunk_size: defaults::chunk_size(),
            verify_checksums: defaults::verify_checksums(),
            max_sync_threads: defaults::max_sync_threads(),
            resync_interval: defaults::resync_interval(),
        }
    }
}

/// `logging.*`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive, e.g. `"info"` or `"meshfs=debug"`.
    #[serde(default = "defaults::log_level")]
    pub level: String,
    /// Accepted for forward-compatibility with file-based rotation; the daemon
    /// itself logs to stdout (see SPEC_FULL.md §F.1).
    #[serde(default)]
    pub max_file_size: Option<u64>,
    /// See `max_file_size`.
    #[serde(default)]
    pub backup_count: Option<u32>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::log_level(),
            max_file_size: None,
            backup_count: None,
        }
    }
}

/// Default values for every optional config key (spec §4.8).
pub mod defaults {
    /// `network.tcp_port`
    pub fn tcp_port() -> u16 {
        9000
    }
    /// `network.discovery_port`
    pub fn discovery_port() -> u16 {
        9050
    }
    /// `network.bind_address`
    pub fn bind_address() -> String {
        "0.0.0.0".to_string()
    }
    /// `network.discovery_enabled`
    pub fn discovery_enabled() -> bool {
        true
    }
    /// `network.heartbeat_interval`
    pub fn heartbeat_interval() -> f64 {
        5.0
    }
    /// `network.reconnect_timeout`
    pub fn reconnect_timeout() -> f64 {
        30.0
    }
    /// `network.connection_deadline`
    pub fn connection_deadline() -> f64 {
        30.0
    }
    /// `network.max_frame_bytes` (64 MiB)
    pub fn max_frame_bytes() -> u32 {
        64 * 1024 * 1024
    }
    /// `filesystem.metadata_db`
    pub fn metadata_db() -> String {
        "metadata.db".to_string()
    }
    /// `filesystem.conflict_resolution`
    pub fn conflict_resolution() -> String {
        "timestamp".to_string()
    }
    /// `sync.batch_size`
    pub fn batch_size() -> usize {
        10
    }
    /// `sync.chunk_size` (1 MiB)
    pub fn chunk_size() -> usize {
        1024 * 1024
    }
    /// `sync.verify_checksums`
    pub fn verify_checksums() -> bool {
        true
    }
    /// `sync.max_sync_threads`
    pub fn max_sync_threads() -> usize {
        4
    }
    /// `sync.resync_interval` (5 minutes)
    pub fn resync_interval() -> f64 {
        300.0
    }
    /// `logging.level`
    pub fn log_level() -> String {
        "info".to_string()
    }
    /// Discovery announce interval (spec §4.5: "default every 5 s").
    pub fn discovery_interval() -> f64 {
        5.0
    }
    /// Outbound sync retry budget (spec §4.7(a), Open Question — resolved in DESIGN.md).
    pub fn sync_retry_attempts() -> u32 {
        3
    }
    /// Base backoff for outbound sync retries, doubling per attempt (~1s, 2s, 4s).
    pub fn sync_retry_base_secs() -> u64 {
        1
    }
    /// Heartbeat failures before alive -> suspect -> dead (spec §4.6: "three consecutive failures").
    pub fn heartbeat_failure_threshold() -> u32 {
        3
    }
    /// Timestamp sanity window (spec §4.1: "more than five minutes").
    pub fn timestamp_skew_secs() -> f64 {
        300.0
    }
    /// Interval between low-frequency Metadata Store maintenance ticks (1 hour).
    pub fn vacuum_interval() -> f64 {
        3600.0
    }
}

/// Sorted snapshot of active records, as exchanged by `sync/sync_metadata`
/// (spec §4.7(c)): filepath -> (version, checksum).
pub type MetadataSnapshot = BTreeMap<String, (u64, String)>;
