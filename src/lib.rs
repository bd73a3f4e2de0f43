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

//! Meshfs - a peer-to-peer replicated file namespace for a trusted LAN.
//!
//! This crate provides:
//! - A Local Store (namespace-rooted filesystem adapter) and a sled-backed
//!   Metadata Store tracking per-file versions and an append-only sync log
//! - UDP broadcast discovery and TCP heartbeat liveness probing, feeding a
//!   shared Peer Registry
//! - A Replication Engine doing local-change fan-out, inbound sync
//!   application with last-writer-wins conflict resolution, and
//!   reconnect-time reconciliation
//! - A length-prefixed JSON Message Router dispatching the command, sync,
//!   and heartbeat surfaces over one request/response TCP connection each
//! - Prometheus metrics behind an optional `/metrics` HTTP endpoint

/// Core protocol primitives (wire types, framing, the two local stores).
pub mod core;
/// The composed daemon: wiring, startup order, and graceful shutdown.
pub mod daemon;
/// Observability (Prometheus metrics, the optional scrape endpoint).
pub mod monitoring;
/// Peer discovery, liveness, replication, and the message router.
pub mod networking;
