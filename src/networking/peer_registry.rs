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

//! Mapping from node_id to [`Peer`], plus an address index (spec §4.4).
//!
//! Guarded by a single [`std::sync::Mutex`]; every operation is O(peers) and
//! none does I/O while the lock is held, so a synchronous mutex is
//! sufficient and never blocks an async worker across an `.await`.

use crate::core::types::{Liveness, NodeStats, Peer};
use std::collections::HashMap;
use std::sync::Mutex;

struct Inner {
    peers: HashMap<String, Peer>,
    by_addr: HashMap<String, String>,
}

/// The node's view of every other node it has heard from.
pub struct PeerRegistry {
    inner: Mutex<Inner>,
}

impl PeerRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                peers: HashMap::new(),
                by_addr: HashMap::new(),
            }),
        }
    }

    /// Record contact with a peer: updates `last_seen` and `stats`, inserts
    /// if unknown, and transitions liveness to `alive`. `node_id` may be the
    /// peer's `node.name` if known, or `host:tcp_port` as a stand-in key
    /// before its identity is learned. The second element of the return
    /// value is `true` exactly when this is the peer's first contact, the
    /// trigger reconciliation needs to run on a cold reconnect rather than
    /// waiting for the next periodic resync.
    pub fn observe(
        &self,
        node_id: &str,
        host: &str,
        tcp_port: u16,
        now: f64,
        version_string: String,
        stats: NodeStats,
    ) -> (Peer, bool) {
        let addr = format!("{host}:{tcp_port}");
        let mut guard = self.inner.lock().expect("peer registry mutex poisoned");
        let is_new = !guard.peers.contains_key(node_id);
        let peer = guard
            .peers
            .entry(node_id.to_string())
            .or_insert_with(|| Peer {
                node_id: node_id.to_string(),
                host: host.to_string(),
                tcp_port,
                last_seen: now,
                liveness: Liveness::Alive,
                version_string: String::new(),
                stats: NodeStats::default(),
            });
        peer.host = host.to_string();
        peer.tcp_port = tcp_port;
        peer.last_seen = now;
        peer.liveness = Liveness::Alive;
        peer.version_string = version_string;
        peer.stats = stats;
        let result = peer.clone();
        guard.by_addr.insert(addr, node_id.to_string());
        (result, is_new)
    }

    /// A single peer by its node_id, if known.
    pub fn get(&self, node_id: &str) -> Option<Peer> {
        self.inner
            .lock()
            .expect("peer registry mutex poisoned")
            .peers
            .get(node_id)
            .cloned()
    }

    /// Node_id registered for a given `host:tcp_port`, if any.
    pub fn node_id_for_addr(&self, host: &str, tcp_port: u16) -> Option<String> {
        let addr = format!("{host}:{tcp_port}");
        self.inner
            .lock()
            .expect("peer registry mutex poisoned")
            .by_addr
            .get(&addr)
            .cloned()
    }

    /// A stable snapshot of every known peer, for fan-out.
    pub fn snapshot(&self) -> Vec<Peer> {
        self.inner
            .lock()
            .expect("peer registry mutex poisoned")
            .peers
            .values()
            .cloned()
            .collect()
    }

    /// Every peer currently `Alive`.
    pub fn alive_snapshot(&self) -> Vec<Peer> {
        self.inner
            .lock()
            .expect("peer registry mutex poisoned")
            .peers
            .values()
            .filter(|p| p.liveness == Liveness::Alive)
            .cloned()
            .collect()
    }

    /// Count of peers currently known, regardless of liveness.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("peer registry mutex poisoned").peers.len()
    }

    /// `(alive, suspect)` counts, for the liveness gauges.
    pub fn liveness_counts(&self) -> (usize, usize) {
        let guard = self.inner.lock().expect("peer registry mutex poisoned");
        let alive = guard.peers.values().filter(|p| p.liveness == Liveness::Alive).count();
        let suspect = guard.peers.values().filter(|p| p.liveness == Liveness::Suspect).count();
        (alive, suspect)
    }

    /// True if no peer has been observed yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Demote a peer one notch toward `dead`: `alive -> suspect -> dead`.
    /// Returns the peer's liveness after the transition.
    pub fn demote(&self, node_id: &str) -> Option<Liveness> {
        let mut guard = self.inner.lock().expect("peer registry mutex poisoned");
        let peer = guard.peers.get_mut(node_id)?;
        peer.liveness = match peer.liveness {
            Liveness::Alive => Liveness::Suspect,
            Liveness::Suspect | Liveness::Dead => Liveness::Dead,
        };
        Some(peer.liveness)
    }

    /// Set a peer's liveness directly, e.g. by the heartbeat service's
    /// consecutive-failure counter rather than the single-step `demote`.
    pub fn set_liveness(&self, node_id: &str, liveness: Liveness) -> Option<Liveness> {
        let mut guard = self.inner.lock().expect("peer registry mutex poisoned");
        let peer = guard.peers.get_mut(node_id)?;
        peer.liveness = liveness;
        Some(peer.liveness)
    }

    /// Explicit eviction by the heartbeat service after repeated failures.
    /// Returns the removed peer, if it was known.
    pub fn mark_dead(&self, node_id: &str) -> Option<Peer> {
        let mut guard = self.inner.lock().expect("peer registry mutex poisoned");
        let removed = guard.peers.remove(node_id);
        if let Some(p) = &removed {
            let addr = format!("{}:{}", p.host, p.tcp_port);
            guard.by_addr.remove(&addr);
        }
        removed
    }

    /// Evict every peer with `now - last_seen > reconnect_timeout`. Returns
    /// the node_ids removed, so the Replication Engine can cancel
    /// outstanding work addressed to them.
    pub fn reap(&self, now: f64, reconnect_timeout: f64) -> Vec<String> {
        let mut guard = self.inner.lock().expect("peer registry mutex poisoned");
        let stale: Vec<String> = guard
            .peers
            .iter()
            .filter(|(_, p)| now - p.last_seen > reconnect_timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            if let Some(p) = guard.peers.remove(id) {
                let addr = format!("{}:{}", p.host, p.tcp_port);
                guard.by_addr.remove(&addr);
            }
        }
        stale
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observe_reports_first_contact_once() {
        let reg = PeerRegistry::new();
        let (_, first) = reg.observe("node-b", "10.0.0.2", 9000, 100.0, "0.1.0".into(), NodeStats::default());
        let (_, second) = reg.observe("node-b", "10.0.0.2", 9000, 101.0, "0.1.0".into(), NodeStats::default());
        assert!(first);
        assert!(!second);
    }

    #[test]
    fn observe_inserts_and_marks_alive() {
        let reg = PeerRegistry::new();
        reg.observe("node-b", "10.0.0.2", 9000, 100.0, "0.1.0".into(), NodeStats::default());
        let peer = reg.get("node-b").unwrap();
        assert_eq!(peer.liveness, Liveness::Alive);
        assert_eq!(peer.last_seen, 100.0);
    }

    #[test]
    fn reap_evicts_stale_peers_and_reports_ids() {
        let reg = PeerRegistry::new();
        reg.observe("node-b", "10.0.0.2", 9000, 0.0, "0.1.0".into(), NodeStats::default());
        let removed = reg.reap(31.0, 30.0);
        assert_eq!(removed, vec!["node-b".to_string()]);
        assert!(reg.get("node-b").is_none());
    }

    #[test]
    fn reap_keeps_fresh_peers() {
        let reg = PeerRegistry::new();
        reg.observe("node-b", "10.0.0.2", 9000, 100.0, "0.1.0".into(), NodeStats::default());
        let removed = reg.reap(110.0, 30.0);
        assert!(removed.is_empty());
        assert!(reg.get("node-b").is_some());
    }

    #[test]
    fn demote_transitions_alive_to_suspect_to_dead() {
        let reg = PeerRegistry::new();
        reg.observe("node-b", "10.0.0.2", 9000, 0.0, "0.1.0".into(), NodeStats::default());
        assert_eq!(reg.demote("node-b"), Some(Liveness::Suspect));
        assert_eq!(reg.demote("node-b"), Some(Liveness::Dead));
    }

    #[test]
    fn mark_dead_removes_peer_and_address_index() {
        let reg = PeerRegistry::new();
        reg.observe("node-b", "10.0.0.2", 9000, 0.0, "0.1.0".into(), NodeStats::default());
        assert!(reg.mark_dead("node-b").is_some());
        assert!(reg.get("node-b").is_none());
        assert!(reg.node_id_for_addr("10.0.0.2", 9000).is_none());
    }
}
