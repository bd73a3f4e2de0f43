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

//! Thin contract over the host file namespace (spec §4.2). Every operation
//! takes a root-relative, forward-slash path and validates it by resolving
//! and containment-checking, never by string-scanning alone.

use crate::core::error::{ErrorKind, HasKind};
use ring::digest;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tokio::fs;

/// Local Store errors (spec §4.2, §7).
#[derive(Debug, Error)]
pub enum LocalStoreError {
    /// Path is absolute, contains `..`, or names a reserved device.
    #[error("invalid path: {0}")]
    InvalidPath(String),
    /// `create` target already exists.
    #[error("already exists")]
    Exists,
    /// `read`/`delete` target does not exist.
    #[error("not found")]
    NotFound,
    /// `read` target is a directory.
    #[error("is a directory")]
    IsDirectory,
    /// Underlying I/O failure.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl HasKind for LocalStoreError {
    fn kind(&self) -> ErrorKind {
        match self {
            LocalStoreError::InvalidPath(_) => ErrorKind::InvalidPath,
            LocalStoreError::Exists => ErrorKind::Exists,
            LocalStoreError::NotFound => ErrorKind::NotFound,
            LocalStoreError::IsDirectory => ErrorKind::IsDirectory,
            LocalStoreError::Io(_) => ErrorKind::WriteFailed,
        }
    }
}

/// Reserved device names that must not appear as any path component,
/// case-insensitively (spec §4.2).
const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// One immediate child of a listed directory.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DirEntry {
    /// Child's filepath relative to the store root.
    pub filepath: String,
    /// Whether the child is a directory.
    pub is_directory: bool,
}

/// Adapter rooted at a configured directory on the host filesystem.
#[derive(Clone, Debug)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    /// Open (creating if necessary) the store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, LocalStoreError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        let root = fs::canonicalize(&root).await?;
        Ok(Self { root })
    }

    /// Validate `path` and resolve it to an absolute path inside the root,
    /// without requiring the target to already exist. Rejects absolute
    /// inputs, any `..` component, and reserved device names; then confirms
    /// containment against the canonicalized root so a symlinked ancestor
    /// cannot smuggle the resolved path outside of it.
    fn resolve(&self, path: &str) -> Result<PathBuf, LocalStoreError> {
        if path.is_empty() {
            return Err(LocalStoreError::InvalidPath("empty path".to_string()));
        }

        let mut joined = self.root.clone();
        for raw in path.split('/') {
            if raw.is_empty() || raw == "." {
                continue;
            }
            if raw == ".." {
                return Err(LocalStoreError::InvalidPath(path.to_string()));
            }
            let upper = raw.to_ascii_uppercase();
            let stem = upper.split('.').next().unwrap_or(&upper);
            if RESERVED_NAMES.contains(&stem) {
                return Err(LocalStoreError::InvalidPath(path.to_string()));
            }
            joined.push(raw);
        }

        // A leading '/' or a Windows drive prefix ("C:/...") parses as a
        // `RootDir`/`Prefix` component rather than `Normal`, so the split-based
        // scan above never sees it; check independently.
        if Path::new(path).is_absolute() {
            return Err(LocalStoreError::InvalidPath(path.to_string()));
        }
        if Path::new(path)
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
        {
            return Err(LocalStoreError::InvalidPath(path.to_string()));
        }

        // Containment check: resolve the nearest existing ancestor and verify
        // the result still lives under root (defends against a symlinked
        // intermediate directory pointing outside the root).
        if let Some(parent) = joined.parent() {
            if let Ok(canon_parent) = parent.canonicalize() {
                if !canon_parent.starts_with(&self.root) {
                    return Err(LocalStoreError::InvalidPath(path.to_string()));
                }
            }
        }

        Ok(joined)
    }

    fn relativize(&self, abs: &Path) -> String {
        abs.strip_prefix(&self.root)
            .unwrap_or(abs)
            .to_string_lossy()
            .replace('\\', "/")
    }

    /// Create an empty regular file. Fails `Exists` if present.
    pub async fn create(&self, path: &str) -> Result<(), LocalStoreError> {
        let abs = self.resolve(path)?;
        if let Some(parent) = abs.parent() {
            fs::create_dir_all(parent).await?;
        }
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&abs)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(LocalStoreError::Exists),
            Err(e) => Err(LocalStoreError::Io(e)),
        }
    }

    /// Overwrite-or-create `path` with `bytes`. Returns the new size.
    pub async fn write(&self, path: &str, bytes: &[u8]) -> Result<u64, LocalStoreError> {
        let abs = self.resolve(path)?;
        if let Some(parent) = abs.parent() {
            fs::create_dir_all(parent).await?;
        }
        if abs.is_dir() {
            return Err(LocalStoreError::IsDirectory);
        }
        fs::write(&abs, bytes).await?;
        Ok(bytes.len() as u64)
    }

    /// Read the full body at `path`.
    pub async fn read(&self, path: &str) -> Result<Vec<u8>, LocalStoreError> {
        let abs = self.resolve(path)?;
        let meta = fs::metadata(&abs)
            .await
            .map_err(|e| classify_missing(e))?;
        if meta.is_dir() {
            return Err(LocalStoreError::IsDirectory);
        }
        Ok(fs::read(&abs).await?)
    }

    /// Remove a file or empty directory. Idempotent: a missing path is `Ok`.
    pub async fn delete(&self, path: &str) -> Result<(), LocalStoreError> {
        let abs = self.resolve(path)?;
        match fs::metadata(&abs).await {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(LocalStoreError::Io(e)),
            Ok(meta) if meta.is_dir() => match fs::remove_dir(&abs).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(LocalStoreError::Io(e)),
            },
            Ok(_) => match fs::remove_file(&abs).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(LocalStoreError::Io(e)),
            },
        }
    }

    /// Recursively create a directory. Idempotent.
    pub async fn mkdir(&self, path: &str) -> Result<(), LocalStoreError> {
        let abs = self.resolve(path)?;
        fs::create_dir_all(&abs).await?;
        Ok(())
    }

    /// List the immediate children of `path` (use `""` for the root).
    pub async fn list(&self, path: &str) -> Result<Vec<DirEntry>, LocalStoreError> {
        let abs = if path.is_empty() {
            self.root.clone()
        } else {
            self.resolve(path)?
        };
        let mut rd = fs::read_dir(&abs).await.map_err(classify_missing)?;
        let mut out = Vec::new();
        while let Some(entry) = rd.next_entry().await? {
            let ft = entry.file_type().await?;
            out.push(DirEntry {
                filepath: self.relativize(&entry.path()),
                is_directory: ft.is_dir(),
            });
        }
        out.sort_by(|a, b| a.filepath.cmp(&b.filepath));
        Ok(out)
    }

    /// Full SHA-256 hex of the file body at `path`. Directories hash to `""`.
    pub async fn hash(&self, path: &str) -> Result<String, LocalStoreError> {
        let abs = self.resolve(path)?;
        let meta = fs::metadata(&abs).await.map_err(classify_missing)?;
        if meta.is_dir() {
            return Ok(String::new());
        }
        let bytes = fs::read(&abs).await?;
        Ok(hex::encode(digest::digest(&digest::SHA256, &bytes).as_ref()))
    }
}

fn classify_missing(e: std::io::Error) -> LocalStoreError {
    if e.kind() == std::io::ErrorKind::NotFound {
        LocalStoreError::NotFound
    } else {
        LocalStoreError::Io(e)
    }
}
