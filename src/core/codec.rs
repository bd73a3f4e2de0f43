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

//! Framing, checksumming, and timestamp sanity checks for the wire protocol
//! (spec §4.1).
//!
//! A TCP frame is a 4-byte big-endian length prefix followed by exactly that
//! many bytes of JSON. UDP discovery datagrams carry the same JSON shape with
//! no length prefix, since the datagram boundary already delimits the message.

use crate::core::error::{ErrorKind, HasKind};
use crate::core::types::Envelope;
use ring::digest;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Codec errors (spec §7: `protocol`, `integrity`, `stale`).
#[derive(Debug, Error)]
pub enum CodecError {
    /// Frame length exceeds the configured ceiling.
    #[error("frame of {0} bytes exceeds the configured ceiling")]
    FrameTooLarge(u32),
    /// Underlying I/O failure while reading or writing a frame.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    /// JSON body did not parse, or a required field was missing.
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    /// `checksum` did not match the recomputed value.
    #[error("checksum mismatch")]
    ChecksumMismatch,
    /// `timestamp` is outside the acceptable clock-skew window.
    #[error("timestamp out of window")]
    Stale,
}

impl HasKind for CodecError {
    fn kind(&self) -> ErrorKind {
        match self {
            CodecError::FrameTooLarge(_) | CodecError::Io(_) | CodecError::Malformed(_) => {
                ErrorKind::Protocol
            }
            CodecError::ChecksumMismatch => ErrorKind::Integrity,
            CodecError::Stale => ErrorKind::Stale,
        }
    }
}

/// Number of hex characters kept from the full SHA-256 digest (spec §4.1:
/// "The first 16 lowercase hex characters").
const CHECKSUM_HEX_LEN: usize = 16;

/// Compute the transmitted checksum for `env`: SHA-256 over the deterministic
/// JSON encoding of `env` with `checksum` forced to `""` and object keys
/// sorted, truncated to the first 16 lowercase hex characters.
///
/// `serde_json` serializes map/struct keys in the order given to it, but
/// without the `preserve_order` feature (not enabled here) its internal
/// `Map` is a `BTreeMap`, so struct field order is exactly declaration
/// order and nested `serde_json::Value::Object` maps are sorted — this is
/// what makes the encoding deterministic across sender/receiver.
pub fn compute_checksum(env: &Envelope) -> Result<String, CodecError> {
    let mut zeroed = env.clone();
    zeroed.checksum = String::new();
    let bytes = serde_json::to_vec(&zeroed)?;
    let digest = digest::digest(&digest::SHA256, &bytes);
    let hex = hex::encode(digest.as_ref());
    Ok(hex[..CHECKSUM_HEX_LEN].to_string())
}

/// Verify that `env.checksum` matches its recomputed value.
pub fn verify_checksum(env: &Envelope) -> Result<(), CodecError> {
    let expected = compute_checksum(env)?;
    if expected == env.checksum {
        Ok(())
    } else {
        Err(CodecError::ChecksumMismatch)
    }
}

/// Set `env.checksum` to its correct value, ready for transmission.
pub fn seal(env: &mut Envelope) -> Result<(), CodecError> {
    env.checksum = compute_checksum(env)?;
    Ok(())
}

/// Verify both wire-level guarantees a receiver must enforce on every
/// inbound message (spec §4.1): checksum integrity, then clock skew.
pub fn validate_inbound(env: &Envelope, skew_secs: f64) -> Result<(), CodecError> {
    verify_checksum(env)?;
    check_timestamp_sane(env.timestamp, skew_secs)
}

/// Reject messages whose `timestamp` differs from local clock by more than
/// `skew_secs` (spec §4.1 default: 5 minutes). Loosely synchronized clocks are
/// assumed; no logical/vector clock is used.
pub fn check_timestamp_sane(timestamp: f64, skew_secs: f64) -> Result<(), CodecError> {
    let now = now_secs();
    if (now - timestamp).abs() > skew_secs {
        return Err(CodecError::Stale);
    }
    Ok(())
}

/// Current wall-clock time in seconds since UNIX epoch, as an `f64` to match
/// `FileRecord::modified_time` and `Envelope::timestamp`.
pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Read one length-prefixed TCP frame and parse it as an [`Envelope`].
/// `max_frame_bytes` enforces the configured ceiling (spec §4.1, default 64 MiB).
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_frame_bytes: u32,
) -> Result<Envelope, CodecError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len > max_frame_bytes {
        return Err(CodecError::FrameTooLarge(len));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    let env: Envelope = serde_json::from_slice(&body)?;
    Ok(env)
}

/// Serialize `env` and write it as one length-prefixed TCP frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    env: &Envelope,
) -> Result<(), CodecError> {
    let mut sealed = env.clone();
    seal(&mut sealed)?;
    let body = serde_json::to_vec(&sealed)?;
    let len = u32::try_from(body.len()).map_err(|_| CodecError::FrameTooLarge(u32::MAX))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Encode `env` as a raw UDP discovery datagram (no length prefix), sealed
/// with its correct checksum.
pub fn encode_datagram(env: &Envelope) -> Result<Vec<u8>, CodecError> {
    let mut sealed = env.clone();
    seal(&mut sealed)?;
    Ok(serde_json::to_vec(&sealed)?)
}

/// Decode a raw UDP discovery datagram into an [`Envelope`].
pub fn decode_datagram(bytes: &[u8]) -> Result<Envelope, CodecError> {
    Ok(serde_json::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::MessageType;

    fn sample() -> Envelope {
        Envelope {
            kind: MessageType::Command,
            action: "create".to_string(),
            path: "a.txt".to_string(),
            content: serde_json::json!({}),
            origin: "node-a".to_string(),
            timestamp: now_secs(),
            checksum: String::new(),
            sequence: None,
        }
    }

    #[test]
    fn checksum_round_trips() {
        let mut env = sample();
        seal(&mut env).unwrap();
        assert_eq!(env.checksum.len(), CHECKSUM_HEX_LEN);
        assert!(verify_checksum(&env).is_ok());
    }

    #[test]
    fn tampering_flips_checksum() {
        let mut env = sample();
        seal(&mut env).unwrap();
        env.path = "b.txt".to_string();
        assert!(matches!(
            verify_checksum(&env),
            Err(CodecError::ChecksumMismatch)
        ));
    }

    #[test]
    fn stale_timestamp_rejected() {
        let res = check_timestamp_sane(now_secs() - 3600.0, 300.0);
        assert!(matches!(res, Err(CodecError::Stale)));
    }

    #[tokio::test]
    async fn frame_round_trip() {
        let mut env = sample();
        seal(&mut env).unwrap();
        let mut buf = Vec::new();
        write_frame(&mut buf, &env).await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let parsed = read_frame(&mut cursor, 1024 * 1024).await.unwrap();
        assert_eq!(parsed.checksum, env.checksum);
    }

    #[tokio::test]
    async fn oversize_frame_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(100u32).to_be_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        let res = read_frame(&mut cursor, 10).await;
        assert!(matches!(res, Err(CodecError::FrameTooLarge(100))));
    }
}
