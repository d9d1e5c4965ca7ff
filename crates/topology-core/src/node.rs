//! Nodes tracked by the membership store.

use crate::hash::display_color;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

/// Maximum number of rate samples kept per node.
pub const RATE_HISTORY_CAPACITY: usize = 30;

#[derive(Debug, Error)]
#[error("Unknown node role: {0}")]
pub struct ParseRoleError(String);

/// Role a node plays in the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeRole {
    Client,
    #[default]
    Peer,
    Router,
}

impl NodeRole {
    /// Infer a role from a free-form hint such as a scouting "whatami" string.
    ///
    /// Substring match, case-insensitive. Anything unrecognized is a peer.
    pub fn infer(hint: &str) -> Self {
        let hint = hint.to_ascii_lowercase();
        if hint.contains("router") {
            NodeRole::Router
        } else if hint.contains("client") {
            NodeRole::Client
        } else {
            NodeRole::Peer
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Client => "client",
            NodeRole::Peer => "peer",
            NodeRole::Router => "router",
        }
    }
}

impl Display for NodeRole {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeRole {
    type Err = ParseRoleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "client" => Ok(NodeRole::Client),
            "peer" => Ok(NodeRole::Peer),
            "router" => Ok(NodeRole::Router),
            other => Err(ParseRoleError(other.to_string())),
        }
    }
}

/// How a node entered the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeOrigin {
    /// Backed by a locally managed session
    Managed,
    /// Learned from a presence event or reconciliation snapshot
    Presence,
    /// Inserted by a discovery scan
    Discovered,
}

/// Bounded FIFO of throughput samples (messages per second).
///
/// Append-only; once full, each push evicts the oldest sample.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct RateHistory {
    samples: VecDeque<f64>,
}

impl RateHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a sample, returning the evicted one if the ring was full.
    pub fn push(&mut self, sample: f64) -> Option<f64> {
        let evicted = if self.samples.len() >= RATE_HISTORY_CAPACITY {
            self.samples.pop_front()
        } else {
            None
        };
        self.samples.push_back(sample);
        evicted
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Oldest sample first.
    pub fn iter(&self) -> impl Iterator<Item = f64> + '_ {
        self.samples.iter().copied()
    }

    pub fn latest(&self) -> Option<f64> {
        self.samples.back().copied()
    }
}

/// A node in the membership store.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Opaque stable identity
    pub identity: String,
    pub role: NodeRole,
    /// Endpoint address, when known
    pub endpoint: Option<String>,
    /// Liveliness as last reported by presence or reconciliation
    pub online: bool,
    /// Heartbeats received from this node
    pub message_count: u64,
    pub rate_history: RateHistory,
    /// When the node entered the store (ms since epoch)
    pub created_at: u64,
    /// When the last heartbeat was recorded (ms since epoch)
    pub last_heartbeat_at: Option<u64>,
    pub origin: NodeOrigin,
    /// Display color derived from the identity hash
    pub color: &'static str,
}

impl Node {
    /// Create an offline node with no telemetry.
    pub fn new(identity: &str, origin: NodeOrigin, now_ms: u64) -> Self {
        Self {
            identity: identity.to_string(),
            role: NodeRole::default(),
            endpoint: None,
            online: false,
            message_count: 0,
            rate_history: RateHistory::new(),
            created_at: now_ms,
            last_heartbeat_at: None,
            origin,
            color: display_color(identity),
        }
    }

    /// Apply a patch. Returns true if any field changed.
    pub fn merge(&mut self, patch: &NodePatch) -> bool {
        let mut changed = false;

        if let Some(role) = patch.role
            && role != self.role
        {
            self.role = role;
            changed = true;
        }

        if let Some(endpoint) = &patch.endpoint
            && self.endpoint.as_ref() != Some(endpoint)
        {
            self.endpoint = Some(endpoint.clone());
            changed = true;
        }

        if let Some(origin) = patch.origin
            && origin != self.origin
        {
            self.origin = origin;
            changed = true;
        }

        changed
    }

    /// Count a heartbeat and append a throughput sample.
    ///
    /// The sample is the instantaneous rate implied by the gap since the
    /// previous heartbeat; the first heartbeat records 0.
    pub fn record_heartbeat(&mut self, now_ms: u64) {
        let rate = match self.last_heartbeat_at {
            Some(prev) => 1000.0 / now_ms.saturating_sub(prev).max(1) as f64,
            None => 0.0,
        };
        self.message_count += 1;
        self.rate_history.push(rate);
        self.last_heartbeat_at = Some(now_ms);
    }
}

/// Partial fields for `MembershipStore::upsert`.
///
/// `None` leaves the existing value untouched. Liveliness is not part of a
/// patch; it only moves through presence and reconciliation.
#[derive(Debug, Clone, Default)]
pub struct NodePatch {
    pub role: Option<NodeRole>,
    pub endpoint: Option<String>,
    pub origin: Option<NodeOrigin>,
}

impl NodePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn role(mut self, role: NodeRole) -> Self {
        self.role = Some(role);
        self
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn origin(mut self, origin: NodeOrigin) -> Self {
        self.origin = Some(origin);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_inference() {
        assert_eq!(NodeRole::infer("router"), NodeRole::Router);
        assert_eq!(NodeRole::infer("zenoh-ROUTER-01"), NodeRole::Router);
        assert_eq!(NodeRole::infer("client"), NodeRole::Client);
        assert_eq!(NodeRole::infer("peer"), NodeRole::Peer);
        assert_eq!(NodeRole::infer("unknown"), NodeRole::Peer);
        assert_eq!(NodeRole::infer(""), NodeRole::Peer);
    }

    #[test]
    fn test_role_parse() {
        assert_eq!("Router".parse::<NodeRole>().unwrap(), NodeRole::Router);
        assert!("gateway".parse::<NodeRole>().is_err());
        assert_eq!(NodeRole::Client.to_string(), "client");
    }

    #[test]
    fn test_rate_history_evicts_oldest() {
        let mut history = RateHistory::new();
        for i in 0..RATE_HISTORY_CAPACITY {
            assert_eq!(history.push(i as f64), None);
        }
        assert_eq!(history.len(), RATE_HISTORY_CAPACITY);

        let evicted = history.push(100.0);
        assert_eq!(evicted, Some(0.0));
        assert_eq!(history.len(), RATE_HISTORY_CAPACITY);
        assert_eq!(history.iter().next(), Some(1.0));
        assert_eq!(history.latest(), Some(100.0));
    }

    #[test]
    fn test_record_heartbeat_rate() {
        let mut node = Node::new("n1", NodeOrigin::Presence, 0);
        node.record_heartbeat(1_000);
        node.record_heartbeat(1_500);
        node.record_heartbeat(1_500);

        assert_eq!(node.message_count, 3);
        let samples: Vec<f64> = node.rate_history.iter().collect();
        assert_eq!(samples, vec![0.0, 2.0, 1000.0]);
        assert_eq!(node.last_heartbeat_at, Some(1_500));
    }

    #[test]
    fn test_merge_reports_changes() {
        let mut node = Node::new("n1", NodeOrigin::Presence, 0);
        assert!(!node.merge(&NodePatch::new()));

        let patch = NodePatch::new()
            .role(NodeRole::Router)
            .endpoint("tcp/127.0.0.1:7447");
        assert!(node.merge(&patch));
        assert!(!node.merge(&patch));
        assert_eq!(node.role, NodeRole::Router);
        assert_eq!(node.endpoint.as_deref(), Some("tcp/127.0.0.1:7447"));
        assert_eq!(node.origin, NodeOrigin::Presence);
    }

    #[test]
    fn test_new_node_is_offline() {
        let node = Node::new("n1", NodeOrigin::Discovered, 42);
        assert!(!node.online);
        assert_eq!(node.created_at, 42);
        assert_eq!(node.message_count, 0);
        assert!(node.rate_history.is_empty());
    }
}
