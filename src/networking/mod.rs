#![forbid(unsafe_code)]
#![allow(missing_docs)]

//! Peer networking: registry, discovery, heartbeats, replication, and the
//! TCP message router.

/// Local command surface: validates and dispatches `command/*` actions.
pub mod commands;
/// UDP broadcast discovery (spec §4.5).
pub mod discovery;
/// TCP ping/pong liveness probing (spec §4.6).
pub mod heartbeat;
/// Mapping from node_id to [`peer_registry::Peer`] plus an address index (spec §4.4).
pub mod peer_registry;
/// Outbound push fan-out and inbound sync application (spec §4.7).
pub mod replication;
/// One-request-one-response TCP dispatch (spec §4.9).
pub mod router;
