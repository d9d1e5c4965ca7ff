//! topology-core: Membership and topology tracking for locally managed endpoints.
//!
//! This crate provides the runtime-agnostic pieces of the topology tracker:
//! - `MembershipStore` holding every known node
//! - Presence ingestion and snapshot reconciliation (anti-entropy)
//! - Heartbeat telemetry and discovery ingestion
//! - Edge derivation and circular layout for the connectivity graph
//! - Collaborator traits for endpoints, presence, messaging and discovery,
//!   plus an in-process `InMemoryFabric` implementing all of them

pub mod discovery;
pub mod error;
pub mod events;
pub mod fabric;
pub mod graph;
pub mod hash;
pub mod heartbeat;
pub mod keys;
pub mod node;
pub mod presence;
pub mod reconcile;
pub mod store;
pub mod topology;
pub mod transport;
pub mod view;

pub use discovery::DiscoveryReport;
pub use error::TopologyError;
pub use events::{EventBus, Subscription, TopologyEvent};
pub use fabric::InMemoryFabric;
pub use graph::{Edge, Graph, LayoutParams, Position};
pub use node::{Node, NodeOrigin, NodePatch, NodeRole, RateHistory};
pub use presence::{PresenceEvent, PresenceOutcome};
pub use reconcile::ReconcileReport;
pub use store::MembershipStore;
pub use topology::Topology;
pub use transport::{
    DiscoveryService, Endpoint, EndpointConfig, EndpointFactory, Hello, LivelinessSample,
    MessageBus, PresenceService, PresenceToken, Publisher, Qos, RoleFilter, Sample,
    TransportError,
};
pub use view::{PositionedNode, SessionState, SessionSummary, TopologyView};

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    web_time::SystemTime::now()
        .duration_since(web_time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
