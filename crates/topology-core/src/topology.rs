//! The topology: membership store plus derived graph.
//!
//! `Topology` is the state the single owner mutates. Every producer
//! (presence stream, reconciler, heartbeat stream, session manager,
//! discovery scanner) goes through one of its methods, so it holds all the
//! rules about which producer may create nodes and edges:
//!
//! - Managed nodes are fully meshed with every other managed node
//! - Discovered nodes get one edge to the primary (star)
//! - Presence and reconciliation create bare nodes, never edges
//! - Heartbeats never create nodes

use crate::discovery::discovered_identity;
use crate::graph::{Edge, Graph, LayoutParams, circular_layout};
use crate::node::{Node, NodeOrigin, NodePatch, NodeRole};
use crate::presence::{self, PresenceEvent, PresenceOutcome};
use crate::reconcile::{self, ReconcileReport};
use crate::store::{MembershipStore, Upsert};
use crate::transport::Hello;
use crate::view::{PositionedNode, SessionSummary, TopologyView};
use tracing::debug;

/// A node removed together with the edges that touched it.
#[derive(Debug, Clone)]
pub struct Removed {
    pub node: Node,
    pub edges: Vec<Edge>,
}

/// Membership store, edges and the managed/discovered bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    store: MembershipStore,
    graph: Graph,
    layout: LayoutParams,
    /// Identity of the first managed session
    primary: Option<String>,
    /// Managed identities in open order
    managed: Vec<String>,
    /// Identities inserted by discovery
    discovered: Vec<String>,
}

impl Topology {
    pub fn new(layout: LayoutParams) -> Self {
        Self {
            layout,
            ..Self::default()
        }
    }

    pub fn store(&self) -> &MembershipStore {
        &self.store
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn primary(&self) -> Option<&str> {
        self.primary.as_deref()
    }

    pub fn is_managed(&self, identity: &str) -> bool {
        self.managed.iter().any(|id| id == identity)
    }

    /// Register a managed node and mesh it with the existing managed nodes.
    ///
    /// The first managed node becomes the primary. Returns edges added.
    pub fn add_managed(
        &mut self,
        identity: &str,
        role: NodeRole,
        endpoint: Option<&str>,
        now_ms: u64,
    ) -> usize {
        let mut patch = NodePatch::new().role(role).origin(NodeOrigin::Managed);
        if let Some(endpoint) = endpoint {
            patch = patch.endpoint(endpoint);
        }
        self.store.upsert(identity, patch, now_ms);

        // A presence-created node may be promoted to managed
        self.discovered.retain(|id| id != identity);

        if !self.is_managed(identity) {
            self.managed.push(identity.to_string());
        }
        if self.primary.is_none() {
            self.primary = Some(identity.to_string());
        }

        self.mesh(identity)
    }

    fn mesh(&mut self, identity: &str) -> usize {
        let others: Vec<&str> = self
            .managed
            .iter()
            .map(String::as_str)
            .filter(|id| *id != identity && self.store.contains(id))
            .collect();
        let added = self.graph.connect_all(identity, others);
        debug!("Meshed {} with {} edge(s)", identity, added);
        added
    }

    /// Remove a managed node and every edge touching it.
    ///
    /// The primary can only go through `release_primary`.
    pub fn remove_managed(&mut self, identity: &str) -> Option<Removed> {
        if self.primary.as_deref() == Some(identity) || !self.is_managed(identity) {
            return None;
        }
        self.managed.retain(|id| id != identity);
        self.remove_node(identity)
    }

    /// Remove the primary during teardown.
    pub fn release_primary(&mut self) -> Option<Removed> {
        let primary = self.primary.take()?;
        self.managed.retain(|id| *id != primary);
        self.remove_node(&primary)
    }

    fn remove_node(&mut self, identity: &str) -> Option<Removed> {
        let node = self.store.remove(identity)?;
        let edges = self.graph.remove_touching(identity);
        Some(Removed { node, edges })
    }

    /// Apply a live presence event.
    pub fn apply_presence(&mut self, event: &PresenceEvent, now_ms: u64) -> PresenceOutcome {
        presence::apply(&mut self.store, event, now_ms)
    }

    /// Apply a reconciliation snapshot.
    pub fn apply_snapshot(&mut self, results: &[PresenceEvent], now_ms: u64) -> ReconcileReport {
        reconcile::apply_snapshot(&mut self.store, results, now_ms)
    }

    /// Apply a heartbeat from `identity`.
    ///
    /// Known nodes get their counters bumped; unknown identities are
    /// ignored. Returns whether the heartbeat was counted.
    pub fn apply_heartbeat(&mut self, identity: &str, now_ms: u64) -> bool {
        self.store.record_heartbeat(identity, now_ms)
    }

    /// Insert a discovered peer. Returns its identity if it was new.
    ///
    /// New nodes get a single edge to the primary, when there is one.
    pub fn add_discovered(&mut self, hello: &Hello, now_ms: u64) -> Option<String> {
        let identity = discovered_identity(&hello.address);
        if self.store.contains(&identity) {
            return None;
        }

        let patch = NodePatch::new()
            .role(NodeRole::infer(&hello.role_hint))
            .endpoint(hello.address.clone())
            .origin(NodeOrigin::Discovered);
        if self.store.upsert(&identity, patch, now_ms) != Upsert::Created {
            return None;
        }
        self.discovered.push(identity.clone());

        if let Some(primary) = &self.primary {
            self.graph.add_edge(primary, &identity);
        }
        Some(identity)
    }

    /// Drop every discovered node and its edges.
    pub fn clear_discovered(&mut self) -> Vec<Removed> {
        std::mem::take(&mut self.discovered)
            .iter()
            .filter_map(|id| self.remove_node(id))
            .collect()
    }

    /// Nodes in store order with their circular-layout positions.
    pub fn layout(&self) -> Vec<PositionedNode> {
        let positions = circular_layout(self.store.len(), &self.layout);
        self.store
            .iter()
            .zip(positions)
            .map(|(node, position)| PositionedNode {
                node: node.clone(),
                position,
            })
            .collect()
    }

    /// Snapshot for callers.
    pub fn view(&self, sessions: Vec<SessionSummary>) -> TopologyView {
        TopologyView {
            nodes: self.layout(),
            edges: self.graph.iter().cloned().collect(),
            sessions,
            primary: self.primary.clone(),
        }
    }
}
