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

//! Shared error taxonomy carried on the wire as `response/error` messages.
//!
//! Every subsystem error type implements [`HasKind`] so the router can fold
//! heterogeneous subsystem errors into one `kind` string without losing the
//! underlying `thiserror` message.

use serde::{Deserialize, Serialize};

/// Error kind taxonomy (see spec §7). Serialized as its lowercase name on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed framing or JSON, missing fields, oversize frame.
    Protocol,
    /// Checksum mismatch on a message or a stored body.
    Integrity,
    /// Timestamp out of window, or version not newer on upsert.
    Stale,
    /// Local Store: path does not exist.
    NotFound,
    /// Local Store: path already exists.
    Exists,
    /// Local Store: path names a directory where a file was expected.
    IsDirectory,
    /// Local Store: path escapes the root or names a reserved device.
    InvalidPath,
    /// Local Store or Metadata Store write failed.
    WriteFailed,
    /// Connection deadline exceeded.
    Timeout,
    /// Peer unreachable.
    Unavailable,
    /// Invariant violated; caller should abort.
    Fatal,
}

impl ErrorKind {
    /// Stable wire string for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Protocol => "protocol",
            ErrorKind::Integrity => "integrity",
            ErrorKind::Stale => "stale",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Exists => "exists",
            ErrorKind::IsDirectory => "is_directory",
            ErrorKind::InvalidPath => "invalid_path",
            ErrorKind::WriteFailed => "write_failed",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Fatal => "fatal",
        }
    }
}

/// Implemented by every subsystem error enum so the router can report a
/// uniform `kind` without a central god-enum of every concrete error.
pub trait HasKind {
    /// Classify this error per the §7 taxonomy.
    fn kind(&self) -> ErrorKind;
}

/// Unifies subsystem errors encountered during startup, where there is no
/// peer or client connection to report a `response/error` back to. `main`
/// logs this and exits non-zero (spec §7: `fatal`).
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    /// Config file missing, malformed, or failed validation.
    #[error("configuration: {0}")]
    Config(String),
    /// Metadata Store failed to open.
    #[error("metadata store: {0}")]
    Metadata(#[from] crate::core::store::metadata::MetadataStoreError),
    /// Local Store failed to open.
    #[error("local store: {0}")]
    Local(#[from] crate::core::store::local::LocalStoreError),
    /// A listening socket could not be bound.
    #[error("bind failed: {0}")]
    Bind(#[from] std::io::Error),
    /// Metrics registration failed.
    #[error("metrics: {0}")]
    Metrics(#[from] crate::monitoring::metrics::MetricsError),
}

impl HasKind for DaemonError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Fatal
    }
}
