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

//! Durable, single-writer table of file records plus an append-only sync log
//! (spec §4.3), backed by `sled`.
//!
//! Writes are serialized by an in-process [`tokio::sync::Mutex`] rather than
//! by a `sled` transaction: the records and sync-log trees are independent
//! and the only cross-tree invariant (reject a stale `upsert`) is a
//! read-then-write the mutex already makes atomic with respect to other
//! writers in this process. Readers proceed without the lock, as `sled`
//! itself serializes tree access.

use crate::core::error::{ErrorKind, HasKind};
use crate::core::types::{FileRecord, MetadataSnapshot, NodeStats, SyncLogEntry, SyncStatus};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::Mutex;

/// Metadata Store errors (spec §4.3, §7).
#[derive(Debug, Error)]
pub enum MetadataStoreError {
    /// Attempted `upsert` whose version was not strictly newer than the existing one.
    #[error("stale write for {filepath}: attempted version {attempted} <= existing {existing}")]
    Stale {
        /// Filepath the write targeted.
        filepath: String,
        /// Version already on record.
        existing: u64,
        /// Version the rejected write attempted.
        attempted: u64,
    },
    /// `resolve_sync` referenced a row that does not exist.
    #[error("sync log entry {0} not found")]
    SyncEntryNotFound(u64),
    /// Underlying `sled` failure.
    #[error("sled: {0}")]
    Sled(#[from] sled::Error),
    /// Record or log entry failed to (de)serialize.
    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),
}

impl HasKind for MetadataStoreError {
    fn kind(&self) -> ErrorKind {
        match self {
            MetadataStoreError::Stale { .. } => ErrorKind::Stale,
            MetadataStoreError::SyncEntryNotFound(_) => ErrorKind::NotFound,
            MetadataStoreError::Sled(_) | MetadataStoreError::Serde(_) => ErrorKind::WriteFailed,
        }
    }
}

/// The durable file-records table and append-only sync log.
pub struct MetadataStore {
    db: sled::Db,
    records: sled::Tree,
    sync_log: sled::Tree,
    next_log_id: AtomicU64,
    write_lock: Mutex<()>,
}

impl MetadataStore {
    /// Open (creating if necessary) the metadata database at `path`. `sled`
    /// guarantees no partial records are visible after a crash: a tree's
    /// `insert` is durable once it returns.
    pub async fn open(path: impl AsRef<std::path::Path>) -> Result<Self, MetadataStoreError> {
        let db = sled::open(path)?;
        let records = db.open_tree("records")?;
        let sync_log = db.open_tree("sync_log")?;
        let next_log_id = sync_log
            .iter()
            .keys()
            .last()
            .transpose()?
            .map(|k| u64::from_be_bytes(k.as_ref().try_into().unwrap_or_default()) + 1)
            .unwrap_or(0);
        Ok(Self {
            db,
            records,
            sync_log,
            next_log_id: AtomicU64::new(next_log_id),
            write_lock: Mutex::new(()),
        })
    }

    /// Look up the current record for `filepath`, if any.
    pub fn get(&self, filepath: &str) -> Result<Option<FileRecord>, MetadataStoreError> {
        match self.records.get(filepath.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All non-tombstoned records.
    pub fn all_active(&self) -> Result<Vec<FileRecord>, MetadataStoreError> {
        let mut out = Vec::new();
        for entry in self.records.iter() {
            let (_, bytes) = entry?;
            let record: FileRecord = serde_json::from_slice(&bytes)?;
            if !record.is_deleted {
                out.push(record);
            }
        }
        Ok(out)
    }

    /// `filepath -> (version, checksum)` for every record, tombstones
    /// included, the exact shape exchanged by `sync/sync_metadata` (spec
    /// §4.7(c)). Tombstones must be diffable too: a peer that only ever
    /// compared active records could never learn a path was deleted while
    /// it was offline.
    pub fn snapshot(&self) -> Result<MetadataSnapshot, MetadataStoreError> {
        let mut out = MetadataSnapshot::new();
        for entry in self.records.iter() {
            let (_, bytes) = entry?;
            let record: FileRecord = serde_json::from_slice(&bytes)?;
            out.insert(record.filepath, (record.version, record.checksum));
        }
        Ok(out)
    }

    /// Next version for `filepath`: existing version + 1, else 1.
    pub fn next_version(&self, filepath: &str) -> Result<u64, MetadataStoreError> {
        Ok(self.get(filepath)?.map(|r| r.version + 1).unwrap_or(1))
    }

    /// Insert or replace `record` by filepath. Rejects a write whose version
    /// is not strictly newer than the existing one.
    pub async fn upsert(&self, record: FileRecord) -> Result<FileRecord, MetadataStoreError> {
        let guard = self.write_lock.lock().await;
        self.upsert_locked(&guard, record)
    }

    /// Acquire the writer lock for the duration of a caller-driven critical
    /// section that spans a Local Store body write and this metadata upsert
    /// (spec §4.9, §5: "the metadata writer lock is held across body write
    /// and metadata upsert").
    pub async fn acquire_writer(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.write_lock.lock().await
    }

    /// Same as [`Self::upsert`], but for a caller that already holds the
    /// writer lock via [`Self::acquire_writer`].
    pub fn upsert_locked(
        &self,
        _guard: &tokio::sync::MutexGuard<'_, ()>,
        record: FileRecord,
    ) -> Result<FileRecord, MetadataStoreError> {
        if let Some(existing) = self.get(&record.filepath)? {
            if record.version <= existing.version {
                return Err(MetadataStoreError::Stale {
                    filepath: record.filepath,
                    existing: existing.version,
                    attempted: record.version,
                });
            }
        }
        let bytes = serde_json::to_vec(&record)?;
        self.records.insert(record.filepath.as_bytes(), bytes)?;
        Ok(record)
    }

    /// Append a new pending sync-log row and return it with its assigned id.
    pub async fn append_sync(
        &self,
        mut entry: SyncLogEntry,
    ) -> Result<SyncLogEntry, MetadataStoreError> {
        let _guard = self.write_lock.lock().await;
        let id = self.next_log_id.fetch_add(1, Ordering::SeqCst);
        entry.id = id;
        let bytes = serde_json::to_vec(&entry)?;
        self.sync_log.insert(id.to_be_bytes(), bytes)?;
        Ok(entry)
    }

    /// Resolve a previously appended sync-log row to a terminal status.
    pub async fn resolve_sync(
        &self,
        id: u64,
        status: SyncStatus,
        error_message: Option<String>,
    ) -> Result<SyncLogEntry, MetadataStoreError> {
        let _guard = self.write_lock.lock().await;
        let key = id.to_be_bytes();
        let bytes = self
            .sync_log
            .get(key)?
            .ok_or(MetadataStoreError::SyncEntryNotFound(id))?;
        let mut entry: SyncLogEntry = serde_json::from_slice(&bytes)?;
        entry.status = status;
        entry.error_message = error_message;
        self.sync_log.insert(key, serde_json::to_vec(&entry)?)?;
        Ok(entry)
    }

    /// Count of sync-log rows still `Pending`.
    pub fn pending_sync_count(&self) -> Result<u64, MetadataStoreError> {
        let mut count = 0;
        for entry in self.sync_log.iter() {
            let (_, bytes) = entry?;
            let row: SyncLogEntry = serde_json::from_slice(&bytes)?;
            if row.status == SyncStatus::Pending {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Totals by state, carried inside heartbeats (spec §4.6).
    pub fn stats(&self) -> Result<NodeStats, MetadataStoreError> {
        let mut active = 0u64;
        let mut deleted = 0u64;
        for entry in self.records.iter() {
            let (_, bytes) = entry?;
            let record: FileRecord = serde_json::from_slice(&bytes)?;
            if record.is_deleted {
                deleted += 1;
            } else {
                active += 1;
            }
        }
        Ok(NodeStats {
            active_files: active,
            deleted_files: deleted,
            pending_syncs: self.pending_sync_count()?,
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }

    /// Compact the backing store. Optional; safe to skip under time pressure.
    pub async fn vacuum(&self) -> Result<(), MetadataStoreError> {
        let _guard = self.write_lock.lock().await;
        self.db.flush_async().await?;
        Ok(())
    }
}
