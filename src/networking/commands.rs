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

//! Local Command Surface (spec §4.9): the six file actions validate the
//! path, mutate the Local Store and Metadata Store under the metadata
//! writer lock, and emit a replication event before releasing it.

use crate::core::codec::now_secs;
use crate::core::error::HasKind;
use crate::core::store::local::LocalStore;
use crate::core::store::metadata::MetadataStore;
use crate::core::types::{Envelope, FileOperation, FileRecord, MessageType};
use crate::monitoring::metrics::Metrics;
use crate::networking::replication::ReplicationEngine;
use std::sync::Arc;

/// Dispatches `command/*` actions against the two local stores.
pub struct CommandHandler {
    metadata: Arc<MetadataStore>,
    local: Arc<LocalStore>,
    replication: Arc<ReplicationEngine>,
    node_id: String,
    metrics: Arc<Metrics>,
}

impl CommandHandler {
    /// Build a new handler.
    pub fn new(
        metadata: Arc<MetadataStore>,
        local: Arc<LocalStore>,
        replication: Arc<ReplicationEngine>,
        node_id: String,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            metadata,
            local,
            replication,
            node_id,
            metrics,
        })
    }

    /// Dispatch one `command/*` envelope to the matching handler.
    pub async fn handle(&self, env: Envelope) -> Envelope {
        self.metrics.commands_total.inc();
        let resp = match env.action.as_str() {
            "create" => self.create(&env.path).await,
            "read" => self.read(&env.path).await,
            "write" => self.write(&env.path, &env.content).await,
            "delete" => self.delete(&env.path).await,
            "mkdir" => self.mkdir(&env.path).await,
            "list" => self.list(&env.path).await,
            other => error(&self.node_id, other, "protocol", "unknown command action"),
        };
        if resp.content["success"] == false {
            self.metrics.commands_failed_total.inc();
        }
        resp
    }

    async fn create(&self, path: &str) -> Envelope {
        let guard = self.metadata.acquire_writer().await;
        if let Err(e) = self.local.create(path).await {
            return error(&self.node_id, "create", e.kind().as_str(), &e.to_string());
        }
        let existing = match self.metadata.get(path) {
            Ok(v) => v,
            Err(e) => return error(&self.node_id, "create", e.kind().as_str(), &e.to_string()),
        };
        let now = now_secs();
        let record = FileRecord {
            filepath: path.to_string(),
            checksum: empty_sha256_hex(),
            size: 0,
            version: existing.as_ref().map(|r| r.version + 1).unwrap_or(1),
            modified_time: now,
            created_time: existing.map(|r| r.created_time).unwrap_or(now),
            originating_node_id: self.node_id.clone(),
            last_operation: FileOperation::Create,
            is_deleted: false,
        };
        let committed = match self.metadata.upsert_locked(&guard, record) {
            Ok(r) => r,
            Err(e) => return error(&self.node_id, "create", e.kind().as_str(), &e.to_string()),
        };
        self.replication.push(committed, Some(Vec::new())).await;
        drop(guard);
        ok(&self.node_id, "create", "file created", serde_json::Value::Null)
    }

    async fn write(&self, path: &str, content: &serde_json::Value) -> Envelope {
        let bytes: Vec<u8> = match serde_json::from_value(content.clone()) {
            Ok(b) => b,
            Err(e) => return error(&self.node_id, "write", "protocol", &e.to_string()),
        };
        let guard = self.metadata.acquire_writer().await;
        if let Err(e) = self.local.write(path, &bytes).await {
            return error(&self.node_id, "write", e.kind().as_str(), &e.to_string());
        }
        let existing = match self.metadata.get(path) {
            Ok(v) => v,
            Err(e) => return error(&self.node_id, "write", e.kind().as_str(), &e.to_string()),
        };
        let checksum = match self.local.hash(path).await {
            Ok(h) => h,
            Err(e) => return error(&self.node_id, "write", e.kind().as_str(), &e.to_string()),
        };
        let now = now_secs();
        let record = FileRecord {
            filepath: path.to_string(),
            checksum,
            size: bytes.len() as u64,
            version: existing.as_ref().map(|r| r.version + 1).unwrap_or(1),
            modified_time: now,
            created_time: existing.map(|r| r.created_time).unwrap_or(now),
            originating_node_id: self.node_id.clone(),
            last_operation: FileOperation::Modify,
            is_deleted: false,
        };
        let committed = match self.metadata.upsert_locked(&guard, record) {
            Ok(r) => r,
            Err(e) => return error(&self.node_id, "write", e.kind().as_str(), &e.to_string()),
        };
        self.replication.push(committed, Some(bytes)).await;
        drop(guard);
        ok(&self.node_id, "write", "file written", serde_json::Value::Null)
    }

    async fn read(&self, path: &str) -> Envelope {
        match self.local.read(path).await {
            Ok(bytes) => ok(
                &self.node_id,
                "read",
                "ok",
                serde_json::json!(bytes),
            ),
            Err(e) => error(&self.node_id, "read", e.kind().as_str(), &e.to_string()),
        }
    }

    async fn delete(&self, path: &str) -> Envelope {
        let guard = self.metadata.acquire_writer().await;
        if let Err(e) = self.local.delete(path).await {
            return error(&self.node_id, "delete", e.kind().as_str(), &e.to_string());
        }
        let existing = match self.metadata.get(path) {
            Ok(v) => v,
            Err(e) => return error(&self.node_id, "delete", e.kind().as_str(), &e.to_string()),
        };
        let now = now_secs();
        let record = FileRecord {
            filepath: path.to_string(),
            checksum: String::new(),
            size: 0,
            version: existing.as_ref().map(|r| r.version + 1).unwrap_or(1),
            modified_time: now,
            created_time: existing.map(|r| r.created_time).unwrap_or(now),
            originating_node_id: self.node_id.clone(),
            last_operation: FileOperation::Delete,
            is_deleted: true,
        };
        let committed = match self.metadata.upsert_locked(&guard, record) {
            Ok(r) => r,
            Err(e) => return error(&self.node_id, "delete", e.kind().as_str(), &e.to_string()),
        };
        self.replication.push(committed, None).await;
        drop(guard);
        ok(&self.node_id, "delete", "file deleted", serde_json::Value::Null)
    }

    async fn mkdir(&self, path: &str) -> Envelope {
        let guard = self.metadata.acquire_writer().await;
        if let Err(e) = self.local.mkdir(path).await {
            return error(&self.node_id, "mkdir", e.kind().as_str(), &e.to_string());
        }
        let existing = match self.metadata.get(path) {
            Ok(v) => v,
            Err(e) => return error(&self.node_id, "mkdir", e.kind().as_str(), &e.to_string()),
        };
        let now = now_secs();
        let record = FileRecord {
            filepath: path.to_string(),
            checksum: String::new(),
            size: 0,
            version: existing.as_ref().map(|r| r.version + 1).unwrap_or(1),
            modified_time: now,
            created_time: existing.map(|r| r.created_time).unwrap_or(now),
            originating_node_id: self.node_id.clone(),
            last_operation: FileOperation::Mkdir,
            is_deleted: false,
        };
        let committed = match self.metadata.upsert_locked(&guard, record) {
            Ok(r) => r,
            Err(e) => return error(&self.node_id, "mkdir", e.kind().as_str(), &e.to_string()),
        };
        self.replication.push(committed, None).await;
        drop(guard);
        ok(&self.node_id, "mkdir", "directory created", serde_json::Value::Null)
    }

    async fn list(&self, path: &str) -> Envelope {
        match self.local.list(path).await {
            Ok(entries) => ok(
                &self.node_id,
                "list",
                "ok",
                serde_json::json!(entries),
            ),
            Err(e) => error(&self.node_id, "list", e.kind().as_str(), &e.to_string()),
        }
    }
}

fn empty_sha256_hex() -> String {
    hex::encode(ring::digest::digest(&ring::digest::SHA256, b"").as_ref())
}

fn ok(node_id: &str, action: &str, message: &str, data: serde_json::Value) -> Envelope {
    Envelope {
        kind: MessageType::Response,
        action: action.to_string(),
        path: String::new(),
        content: serde_json::json!({ "success": true, "message": message, "data": data }),
        origin: node_id.to_string(),
        timestamp: now_secs(),
        checksum: String::new(),
        sequence: None,
    }
}

fn error(node_id: &str, action: &str, kind: &str, message: &str) -> Envelope {
    Envelope {
        kind: MessageType::Response,
        action: "error".to_string(),
        path: String::new(),
        content: serde_json::json!({
            "success": false,
            "message": format!("{action}: {kind}: {message}"),
            "data": null,
        }),
        origin: node_id.to_string(),
        timestamp: now_secs(),
        checksum: String::new(),
        sequence: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::networking::peer_registry::PeerRegistry;
    use crate::networking::replication::ReplicationConfig;
    use std::time::Duration;

    async fn handler() -> (tempfile::TempDir, Arc<CommandHandler>) {
        let dir = tempfile::tempdir().unwrap();
        let metadata = Arc::new(MetadataStore::open(dir.path().join("metadata.db")).await.unwrap());
        let local = Arc::new(LocalStore::open(dir.path().join("root")).await.unwrap());
        let registry = Arc::new(PeerRegistry::new());
        let metrics = Arc::new(crate::monitoring::metrics::Metrics::new().unwrap());
        let replication = ReplicationEngine::new(
            metadata.clone(),
            local.clone(),
            registry,
            "node-a".to_string(),
            ReplicationConfig {
                batch_size: 10,
                verify_checksums: true,
                retry_attempts: 3,
                retry_base_secs: 1,
                connection_deadline: Duration::from_secs(5),
            },
            metrics.clone(),
        );
        (dir, CommandHandler::new(metadata, local, replication, "node-a".to_string(), metrics))
    }

    #[tokio::test]
    async fn create_write_read_round_trip() {
        let (_dir, handler) = handler().await;
        let resp = handler.create("a.txt").await;
        assert_eq!(resp.action, "create");
        assert_eq!(resp.content["success"], true);

        let resp = handler.write("a.txt", &serde_json::json!(b"hello".to_vec())).await;
        assert_eq!(resp.content["success"], true);

        let resp = handler.read("a.txt").await;
        let data: Vec<u8> = serde_json::from_value(resp.content["data"].clone()).unwrap();
        assert_eq!(data, b"hello");
    }

    #[tokio::test]
    async fn delete_then_read_not_found() {
        let (_dir, handler) = handler().await;
        handler.create("a.txt").await;
        handler.delete("a.txt").await;
        let resp = handler.read("a.txt").await;
        assert_eq!(resp.content["success"], false);
        assert!(resp.content["message"].as_str().unwrap().contains("not_found"));
    }

    #[tokio::test]
    async fn version_is_monotonic_across_mutations() {
        let (_dir, handler) = handler().await;
        handler.create("a.txt").await;
        handler.write("a.txt", &serde_json::json!(b"x".to_vec())).await;
        handler.write("a.txt", &serde_json::json!(b"y".to_vec())).await;
        let record = handler.metadata.get("a.txt").unwrap().unwrap();
        assert_eq!(record.version, 3);
    }
}
