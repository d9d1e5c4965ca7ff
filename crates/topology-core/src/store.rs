//! Authoritative table of known nodes.
//!
//! The store itself is a plain synchronous structure. Serialization of
//! concurrent producers is the owner's job (see `topology-daemon::actor`).

use crate::node::{Node, NodeOrigin, NodePatch};
use std::collections::HashMap;

/// Result of an upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    /// Node did not exist and was created
    Created,
    /// Node existed and at least one field changed
    Merged,
    /// Node existed and the patch changed nothing
    Unchanged,
}

/// Mapping identity -> node, iterated in insertion order.
#[derive(Debug, Clone, Default)]
pub struct MembershipStore {
    nodes: HashMap<String, Node>,
    /// Insertion order of identities
    order: Vec<String>,
}

impl MembershipStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the node if absent, merge the patch otherwise.
    ///
    /// New nodes take their origin from the patch, defaulting to `Presence`.
    pub fn upsert(&mut self, identity: &str, patch: NodePatch, now_ms: u64) -> Upsert {
        if let Some(node) = self.nodes.get_mut(identity) {
            return if node.merge(&patch) {
                Upsert::Merged
            } else {
                Upsert::Unchanged
            };
        }

        let origin = patch.origin.unwrap_or(NodeOrigin::Presence);
        let mut node = Node::new(identity, origin, now_ms);
        node.merge(&patch);
        self.nodes.insert(identity.to_string(), node);
        self.order.push(identity.to_string());
        Upsert::Created
    }

    /// Set liveliness. Returns true if the flag changed.
    ///
    /// Unknown identities are ignored. Only presence ingestion and
    /// reconciliation may call this.
    pub(crate) fn set_online(&mut self, identity: &str, online: bool) -> bool {
        match self.nodes.get_mut(identity) {
            Some(node) if node.online != online => {
                node.online = online;
                true
            }
            _ => false,
        }
    }

    /// Mark every node offline, returning the identities that were online.
    pub(crate) fn mark_all_offline(&mut self) -> Vec<String> {
        let mut demoted = Vec::new();
        for identity in &self.order {
            if let Some(node) = self.nodes.get_mut(identity)
                && node.online
            {
                node.online = false;
                demoted.push(identity.clone());
            }
        }
        demoted
    }

    /// Count a heartbeat for a known node. Returns false if unknown.
    pub fn record_heartbeat(&mut self, identity: &str, now_ms: u64) -> bool {
        match self.nodes.get_mut(identity) {
            Some(node) => {
                node.record_heartbeat(now_ms);
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, identity: &str) -> Option<Node> {
        let node = self.nodes.remove(identity)?;
        self.order.retain(|id| id != identity);
        Some(node)
    }

    pub fn get(&self, identity: &str) -> Option<&Node> {
        self.nodes.get(identity)
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.nodes.contains_key(identity)
    }

    pub fn is_online(&self, identity: &str) -> bool {
        self.nodes.get(identity).map(|n| n.online).unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.order.iter().filter_map(|id| self.nodes.get(id))
    }

    /// Identities in insertion order.
    pub fn identities(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn online_count(&self) -> usize {
        self.nodes.values().filter(|n| n.online).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{NodeRole, RATE_HISTORY_CAPACITY};

    #[test]
    fn test_upsert_creates_then_merges() {
        let mut store = MembershipStore::new();

        let outcome = store.upsert("n1", NodePatch::new(), 10);
        assert_eq!(outcome, Upsert::Created);
        assert_eq!(store.len(), 1);

        let node = store.get("n1").unwrap();
        assert_eq!(node.origin, NodeOrigin::Presence);
        assert!(!node.online);
        assert_eq!(node.created_at, 10);

        let outcome = store.upsert("n1", NodePatch::new().role(NodeRole::Router), 20);
        assert_eq!(outcome, Upsert::Merged);
        assert_eq!(store.get("n1").unwrap().role, NodeRole::Router);
        // Merge never touches creation time
        assert_eq!(store.get("n1").unwrap().created_at, 10);

        let outcome = store.upsert("n1", NodePatch::new(), 30);
        assert_eq!(outcome, Upsert::Unchanged);
    }

    #[test]
    fn test_upsert_uses_patch_origin() {
        let mut store = MembershipStore::new();
        store.upsert("d1", NodePatch::new().origin(NodeOrigin::Discovered), 0);
        assert_eq!(store.get("d1").unwrap().origin, NodeOrigin::Discovered);
    }

    #[test]
    fn test_set_online_idempotent() {
        let mut store = MembershipStore::new();
        store.upsert("n1", NodePatch::new(), 0);

        assert!(store.set_online("n1", true));
        assert!(!store.set_online("n1", true));
        assert!(store.is_online("n1"));
        assert!(store.set_online("n1", false));
        assert!(!store.is_online("n1"));
    }

    #[test]
    fn test_set_online_unknown_is_noop() {
        let mut store = MembershipStore::new();
        assert!(!store.set_online("ghost", true));
        assert!(store.is_empty());
    }

    #[test]
    fn test_mark_all_offline() {
        let mut store = MembershipStore::new();
        for id in ["n1", "n2", "n3"] {
            store.upsert(id, NodePatch::new(), 0);
        }
        store.set_online("n1", true);
        store.set_online("n3", true);

        let demoted = store.mark_all_offline();
        assert_eq!(demoted, vec!["n1".to_string(), "n3".to_string()]);
        assert_eq!(store.online_count(), 0);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_record_heartbeat_caps_history() {
        let mut store = MembershipStore::new();
        store.upsert("n1", NodePatch::new(), 0);

        for i in 0..(RATE_HISTORY_CAPACITY as u64 + 10) {
            assert!(store.record_heartbeat("n1", 1_000 + i * 100));
        }

        let node = store.get("n1").unwrap();
        assert_eq!(node.message_count, RATE_HISTORY_CAPACITY as u64 + 10);
        assert_eq!(node.rate_history.len(), RATE_HISTORY_CAPACITY);
    }

    #[test]
    fn test_record_heartbeat_unknown() {
        let mut store = MembershipStore::new();
        assert!(!store.record_heartbeat("ghost", 0));
        assert!(store.is_empty());
    }

    #[test]
    fn test_remove_preserves_order_of_rest() {
        let mut store = MembershipStore::new();
        for id in ["n1", "n2", "n3"] {
            store.upsert(id, NodePatch::new(), 0);
        }

        let removed = store.remove("n2");
        assert_eq!(removed.map(|n| n.identity), Some("n2".to_string()));
        assert!(store.remove("n2").is_none());

        let ids: Vec<&str> = store.identities().collect();
        assert_eq!(ids, vec!["n1", "n3"]);
    }
}
