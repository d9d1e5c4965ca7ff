//! Collaborator traits for the underlying messaging fabric.
//!
//! The tracker consumes these; it never implements the transport or the
//! liveliness protocol itself.
//!
//! Implementations:
//! - `InMemoryFabric` - in-process fabric for tests and the demo daemon

use crate::node::NodeRole;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Endpoint open failed: {0}")]
    EndpointOpen(String),

    #[error("Declaration failed: {0}")]
    Declaration(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Subscription failed: {0}")]
    Subscription(String),

    #[error("Resource closed: {0}")]
    Closed(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Opaque endpoint configuration, passed through to the factory.
#[derive(Debug, Clone, Default)]
pub struct EndpointConfig {
    /// Identity announced through presence
    pub identity: String,
    pub role: NodeRole,
    /// Endpoints to connect to (e.g. "tcp/localhost:7447")
    pub connect: Vec<String>,
    /// Endpoints to listen on
    pub listen: Vec<String>,
    /// Whether the endpoint takes part in multicast scouting
    pub scouting: bool,
}

impl EndpointConfig {
    pub fn new(identity: impl Into<String>, role: NodeRole) -> Self {
        Self {
            identity: identity.into(),
            role,
            ..Self::default()
        }
    }

    pub fn connect(mut self, endpoint: impl Into<String>) -> Self {
        self.connect.push(endpoint.into());
        self
    }

    pub fn listen(mut self, endpoint: impl Into<String>) -> Self {
        self.listen.push(endpoint.into());
        self
    }

    /// Address shown for this endpoint: first listen, else first connect.
    pub fn address(&self) -> Option<&str> {
        self.listen
            .first()
            .or_else(|| self.connect.first())
            .map(String::as_str)
    }
}

/// Delivery priority, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    RealTime,
    InteractiveHigh,
    InteractiveLow,
    DataHigh,
    #[default]
    Data,
    DataLow,
    Background,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CongestionControl {
    #[default]
    Block,
    Drop,
}

/// Quality of service for a publisher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Qos {
    pub priority: Priority,
    pub congestion_control: CongestionControl,
    pub express: bool,
}

impl Qos {
    /// Low priority, drop under congestion.
    pub fn heartbeat() -> Self {
        Self {
            priority: Priority::Background,
            congestion_control: CongestionControl::Drop,
            express: false,
        }
    }
}

/// A liveliness change as delivered by the presence service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivelinessSample {
    pub key: String,
    pub alive: bool,
}

/// A message delivered to a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// A scouting reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    /// Free-form role hint (e.g. "router", "peer")
    pub role_hint: String,
    pub address: String,
}

impl Hello {
    pub fn new(role_hint: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            role_hint: role_hint.into(),
            address: address.into(),
        }
    }
}

/// Which roles a discovery scan should report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoleFilter {
    Routers,
    Peers,
    #[default]
    RoutersAndPeers,
}

impl RoleFilter {
    pub fn accepts(&self, role: NodeRole) -> bool {
        match self {
            RoleFilter::Routers => role == NodeRole::Router,
            RoleFilter::Peers => role == NodeRole::Peer,
            RoleFilter::RoutersAndPeers => role != NodeRole::Client,
        }
    }
}

/// Opens endpoints.
#[async_trait]
pub trait EndpointFactory: Send + Sync {
    async fn open(&self, config: &EndpointConfig) -> Result<Arc<dyn Endpoint>>;
}

/// An open endpoint able to declare tokens and publishers.
#[async_trait]
pub trait Endpoint: Send + Sync {
    /// Transport-level endpoint id
    fn id(&self) -> &str;

    /// Declare a liveliness token under `key`. The key stays alive while
    /// the token is held.
    async fn declare_token(&self, key: &str) -> Result<Box<dyn PresenceToken>>;

    async fn declare_publisher(&self, topic: &str, qos: Qos) -> Result<Arc<dyn Publisher>>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait PresenceToken: Send + Sync {
    fn key(&self) -> &str;

    async fn undeclare(&self) -> Result<()>;
}

#[async_trait]
pub trait Publisher: Send + Sync {
    fn topic(&self) -> &str;

    async fn publish(&self, payload: Vec<u8>) -> Result<()>;

    async fn undeclare(&self) -> Result<()>;
}

/// Liveliness subscriptions and snapshot queries.
#[async_trait]
pub trait PresenceService: Send + Sync {
    /// Subscribe to liveliness changes matching `pattern`.
    ///
    /// With `replay`, tokens already alive are delivered first as alive
    /// samples, followed by live changes.
    async fn subscribe(
        &self,
        pattern: &str,
        replay: bool,
    ) -> Result<BoxStream<'static, LivelinessSample>>;

    /// Collect currently alive tokens matching `pattern`.
    ///
    /// Replies arriving after `timeout` are dropped, so the result may be
    /// partial or empty.
    async fn query(&self, pattern: &str, timeout: Duration) -> Result<Vec<LivelinessSample>>;
}

/// Topic subscriptions.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn subscribe(&self, pattern: &str) -> Result<BoxStream<'static, Sample>>;
}

/// Peer discovery.
#[async_trait]
pub trait DiscoveryService: Send + Sync {
    /// Start a scan. The stream ends on its own after a bounded duration.
    async fn scan(&self, filter: RoleFilter) -> Result<BoxStream<'static, Hello>>;
}
