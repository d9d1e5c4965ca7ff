//! Serializable snapshots handed to callers.

use crate::graph::{Edge, Position};
use crate::node::{Node, NodeRole};
use serde::Serialize;

/// Lifecycle state of a managed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Closed,
    Opening,
    Open,
    Closing,
}

/// Diagnostic view of one managed session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    /// Position in the session list; 0 is the primary
    pub index: usize,
    pub identity: String,
    pub role: NodeRole,
    pub endpoint: Option<String>,
    pub state: SessionState,
    pub primary: bool,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub publish_failures: u64,
    pub created_at: u64,
}

/// A node with its layout position.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionedNode {
    #[serde(flatten)]
    pub node: Node,
    pub position: Position,
}

/// Full snapshot of the topology.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologyView {
    pub nodes: Vec<PositionedNode>,
    pub edges: Vec<Edge>,
    pub sessions: Vec<SessionSummary>,
    pub primary: Option<String>,
}

impl TopologyView {
    pub fn node(&self, identity: &str) -> Option<&Node> {
        self.nodes
            .iter()
            .map(|p| &p.node)
            .find(|n| n.identity == identity)
    }

    pub fn has_edge(&self, a: &str, b: &str) -> bool {
        self.edges.contains(&Edge::new(a, b))
    }

    pub fn identities(&self) -> Vec<&str> {
        self.nodes.iter().map(|p| p.node.identity.as_str()).collect()
    }
}
