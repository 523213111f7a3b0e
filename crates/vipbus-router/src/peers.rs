//! Peer table: the identities currently known to the router.
//!
//! Owned by the router loop; everything outside it only sees snapshots.

use crate::config::MessageBus;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// An entry for a single connected peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerEntry {
    pub identity: String,
    /// Transport the peer is reachable over.
    pub bus: MessageBus,
    /// When the router first saw the peer.
    pub connected_at: DateTime<Utc>,
}

/// The router's peer table.
#[derive(Debug, Default)]
pub struct PeerTable {
    peers: BTreeMap<String, PeerEntry>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a peer. Returns `false` if it was already present.
    pub fn insert(&mut self, identity: &str, bus: MessageBus) -> bool {
        if self.peers.contains_key(identity) {
            return false;
        }
        self.peers.insert(
            identity.to_string(),
            PeerEntry {
                identity: identity.to_string(),
                bus,
                connected_at: Utc::now(),
            },
        );
        true
    }

    pub fn remove(&mut self, identity: &str) -> Option<PeerEntry> {
        self.peers.remove(identity)
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.peers.contains_key(identity)
    }

    pub fn get(&self, identity: &str) -> Option<&PeerEntry> {
        self.peers.get(identity)
    }

    /// All identities, sorted.
    pub fn identities(&self) -> Vec<String> {
        self.peers.keys().cloned().collect()
    }

    /// A copy of every entry.
    pub fn snapshot(&self) -> Vec<PeerEntry> {
        self.peers.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_is_idempotent() {
        let mut table = PeerTable::new();
        assert!(table.insert("hvac", MessageBus::Direct));
        assert!(!table.insert("hvac", MessageBus::Broker));
        assert_eq!(table.len(), 1);
        assert_eq!(table.get("hvac").map(|p| p.bus), Some(MessageBus::Direct));
    }

    #[test]
    fn test_identities_sorted() {
        let mut table = PeerTable::new();
        table.insert("b", MessageBus::Direct);
        table.insert("a", MessageBus::Direct);
        assert_eq!(table.identities(), vec!["a", "b"]);
        assert!(table.remove("a").is_some());
        assert!(table.remove("a").is_none());
        assert!(!table.contains("a"));
    }
}
