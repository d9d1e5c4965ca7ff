//! In-process messaging fabric.
//!
//! Implements every collaborator trait against shared in-memory state, so
//! several "endpoints" opened from one `InMemoryFabric` see each other's
//! liveliness tokens and messages. Used by the test suites and by the demo
//! daemon. Fault injection covers each failure path the session manager
//! and reconciler have to handle.

use crate::keys;
use crate::node::NodeRole;
use crate::transport::{
    DiscoveryService, Endpoint, EndpointConfig, EndpointFactory, Hello, LivelinessSample,
    MessageBus, PresenceService, PresenceToken, Publisher, Qos, Result, RoleFilter, Sample,
    TransportError,
};
use async_trait::async_trait;
use futures::StreamExt;
use futures::channel::mpsc::{UnboundedSender, unbounded};
use futures::stream::{self, BoxStream};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Default)]
struct Faults {
    open_all: bool,
    open: HashSet<String>,
    tokens: bool,
    publishers: bool,
    publish: bool,
    query: bool,
    token_undeclare: bool,
    publisher_undeclare: bool,
    close: bool,
}

#[derive(Default)]
struct FabricState {
    next_id: u64,
    /// Open endpoint ids
    endpoints: HashSet<String>,
    /// token id -> (owning endpoint, key)
    tokens: HashMap<u64, (String, String)>,
    /// publisher id -> (owning endpoint, topic)
    publishers: HashMap<u64, (String, String)>,
    /// key -> number of holders (tokens plus injected liveliness)
    alive: HashMap<String, usize>,
    liveliness_subs: Vec<(String, UnboundedSender<LivelinessSample>)>,
    message_subs: Vec<(String, UnboundedSender<Sample>)>,
    /// topic -> successful publishes
    published: HashMap<String, u64>,
    discovery: Vec<Hello>,
    faults: Faults,
}

impl FabricState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn notify(&mut self, key: &str, alive: bool) {
        let sample = LivelinessSample {
            key: key.to_string(),
            alive,
        };
        // Closed receivers are pruned on the way
        self.liveliness_subs.retain(|(pattern, tx)| {
            !keys::matches(pattern, key) || tx.unbounded_send(sample.clone()).is_ok()
        });
    }

    fn hold(&mut self, key: &str) {
        let count = self.alive.entry(key.to_string()).or_insert(0);
        *count += 1;
        if *count == 1 {
            self.notify(key, true);
        }
    }

    fn release(&mut self, key: &str) {
        let Some(count) = self.alive.get_mut(key) else {
            return;
        };
        *count -= 1;
        if *count == 0 {
            self.alive.remove(key);
            self.notify(key, false);
        }
    }

    fn drop_token(&mut self, id: u64) {
        if let Some((_, key)) = self.tokens.remove(&id) {
            self.release(&key);
        }
    }

    fn deliver(&mut self, topic: &str, payload: &[u8]) {
        let sample = Sample {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        };
        self.message_subs.retain(|(pattern, tx)| {
            !keys::matches(pattern, topic) || tx.unbounded_send(sample.clone()).is_ok()
        });
    }
}

/// Shared in-memory fabric. Clones share state.
#[derive(Clone, Default)]
pub struct InMemoryFabric {
    state: Arc<Mutex<FabricState>>,
}

impl InMemoryFabric {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FabricState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make `open` fail for this identity.
    pub fn fail_open_for(&self, identity: &str) {
        self.lock().faults.open.insert(identity.to_string());
    }

    /// Make every `open` fail.
    pub fn fail_opens(&self, fail: bool) {
        self.lock().faults.open_all = fail;
    }

    pub fn fail_token_declarations(&self, fail: bool) {
        self.lock().faults.tokens = fail;
    }

    pub fn fail_publisher_declarations(&self, fail: bool) {
        self.lock().faults.publishers = fail;
    }

    pub fn fail_publishes(&self, fail: bool) {
        self.lock().faults.publish = fail;
    }

    pub fn fail_queries(&self, fail: bool) {
        self.lock().faults.query = fail;
    }

    /// Make token undeclares fail. A failed undeclare keeps the token held.
    pub fn fail_token_undeclares(&self, fail: bool) {
        self.lock().faults.token_undeclare = fail;
    }

    pub fn fail_publisher_undeclares(&self, fail: bool) {
        self.lock().faults.publisher_undeclare = fail;
    }

    /// Make endpoint `close` fail. The endpoint and whatever it still owns
    /// stay registered.
    pub fn fail_closes(&self, fail: bool) {
        self.lock().faults.close = fail;
    }

    /// Hold or release liveliness for `key` as if a remote endpoint did.
    pub fn inject_liveliness(&self, key: &str, alive: bool) {
        let mut state = self.lock();
        if alive {
            state.hold(key);
        } else {
            state.release(key);
        }
    }

    /// Drop every holder of `key` without telling subscribers.
    ///
    /// Models a lost liveliness delete: queries stop returning the key but
    /// no dead sample is ever delivered.
    pub fn forget_liveliness(&self, key: &str) {
        let mut state = self.lock();
        state.alive.remove(key);
        state.tokens.retain(|_, (_, k)| k.as_str() != key);
    }

    /// Publish on `topic` from outside any endpoint.
    pub fn publish_external(&self, topic: &str, payload: &[u8]) {
        self.lock().deliver(topic, payload);
    }

    /// Set the replies the next discovery scans will return.
    pub fn set_discovery(&self, hellos: Vec<Hello>) {
        self.lock().discovery = hellos;
    }

    pub fn is_alive(&self, key: &str) -> bool {
        self.lock().alive.contains_key(key)
    }

    pub fn open_endpoints(&self) -> usize {
        self.lock().endpoints.len()
    }

    pub fn live_tokens(&self) -> usize {
        self.lock().tokens.len()
    }

    pub fn live_publishers(&self) -> usize {
        self.lock().publishers.len()
    }

    /// Successful publishes on `topic`.
    pub fn published_count(&self, topic: &str) -> u64 {
        self.lock().published.get(topic).copied().unwrap_or(0)
    }
}

#[async_trait]
impl EndpointFactory for InMemoryFabric {
    async fn open(&self, config: &EndpointConfig) -> Result<Arc<dyn Endpoint>> {
        let mut state = self.lock();
        if state.faults.open_all || state.faults.open.contains(&config.identity) {
            return Err(TransportError::EndpointOpen(format!(
                "refused endpoint for {}",
                config.identity
            )));
        }

        let id: u128 = rand::rng().random();
        let id = format!("{:032x}", id);
        state.endpoints.insert(id.clone());
        Ok(Arc::new(MemoryEndpoint {
            id,
            fabric: self.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MemoryEndpoint {
    id: String,
    fabric: InMemoryFabric,
    closed: AtomicBool,
}

impl MemoryEndpoint {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(TransportError::Closed(format!("endpoint {}", self.id)))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Endpoint for MemoryEndpoint {
    fn id(&self) -> &str {
        &self.id
    }

    async fn declare_token(&self, key: &str) -> Result<Box<dyn PresenceToken>> {
        self.ensure_open()?;
        let mut state = self.fabric.lock();
        if state.faults.tokens {
            return Err(TransportError::Declaration(format!("token {}", key)));
        }

        let id = state.next_id();
        state
            .tokens
            .insert(id, (self.id.clone(), key.to_string()));
        state.hold(key);

        Ok(Box::new(MemoryToken {
            id,
            key: key.to_string(),
            fabric: self.fabric.clone(),
            undeclared: AtomicBool::new(false),
        }))
    }

    async fn declare_publisher(&self, topic: &str, _qos: Qos) -> Result<Arc<dyn Publisher>> {
        self.ensure_open()?;
        let mut state = self.fabric.lock();
        if state.faults.publishers {
            return Err(TransportError::Declaration(format!("publisher {}", topic)));
        }

        let id = state.next_id();
        state
            .publishers
            .insert(id, (self.id.clone(), topic.to_string()));

        Ok(Arc::new(MemoryPublisher {
            id,
            topic: topic.to_string(),
            fabric: self.fabric.clone(),
            undeclared: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.fabric.lock();
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        if state.faults.close {
            return Err(TransportError::Closed(format!("refused close of {}", self.id)));
        }

        self.closed.store(true, Ordering::Release);
        state.endpoints.remove(&self.id);

        // Resources still declared on this endpoint die with it
        let orphaned: Vec<u64> = state
            .tokens
            .iter()
            .filter(|(_, (owner, _))| *owner == self.id)
            .map(|(id, _)| *id)
            .collect();
        for id in orphaned {
            state.drop_token(id);
        }
        let id = self.id.clone();
        state.publishers.retain(|_, (owner, _)| *owner != id);
        Ok(())
    }
}

struct MemoryToken {
    id: u64,
    key: String,
    fabric: InMemoryFabric,
    undeclared: AtomicBool,
}

#[async_trait]
impl PresenceToken for MemoryToken {
    fn key(&self) -> &str {
        &self.key
    }

    async fn undeclare(&self) -> Result<()> {
        let mut state = self.fabric.lock();
        if self.undeclared.load(Ordering::Acquire) {
            return Ok(());
        }
        if state.faults.token_undeclare {
            return Err(TransportError::Declaration(format!("undeclare token {}", self.key)));
        }

        self.undeclared.store(true, Ordering::Release);
        state.drop_token(self.id);
        Ok(())
    }
}

struct MemoryPublisher {
    id: u64,
    topic: String,
    fabric: InMemoryFabric,
    undeclared: AtomicBool,
}

#[async_trait]
impl Publisher for MemoryPublisher {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn publish(&self, payload: Vec<u8>) -> Result<()> {
        let mut state = self.fabric.lock();
        if self.undeclared.load(Ordering::Acquire) || !state.publishers.contains_key(&self.id) {
            return Err(TransportError::Closed(format!("publisher {}", self.topic)));
        }
        if state.faults.publish {
            return Err(TransportError::Publish(format!("injected on {}", self.topic)));
        }

        *state.published.entry(self.topic.clone()).or_insert(0) += 1;
        state.deliver(&self.topic, &payload);
        Ok(())
    }

    async fn undeclare(&self) -> Result<()> {
        let mut state = self.fabric.lock();
        if self.undeclared.load(Ordering::Acquire) {
            return Ok(());
        }
        if state.faults.publisher_undeclare {
            return Err(TransportError::Declaration(format!(
                "undeclare publisher {}",
                self.topic
            )));
        }

        self.undeclared.store(true, Ordering::Release);
        state.publishers.remove(&self.id);
        Ok(())
    }
}

#[async_trait]
impl PresenceService for InMemoryFabric {
    async fn subscribe(
        &self,
        pattern: &str,
        replay: bool,
    ) -> Result<BoxStream<'static, LivelinessSample>> {
        let (tx, rx) = unbounded();
        let mut state = self.lock();

        // Replay and registration share the lock so nothing slips between
        if replay {
            let current: Vec<String> = state
                .alive
                .keys()
                .filter(|key| keys::matches(pattern, key))
                .cloned()
                .collect();
            for key in current {
                let _ = tx.unbounded_send(LivelinessSample { key, alive: true });
            }
        }
        state.liveliness_subs.push((pattern.to_string(), tx));

        Ok(rx.boxed())
    }

    async fn query(&self, pattern: &str, _timeout: Duration) -> Result<Vec<LivelinessSample>> {
        let state = self.lock();
        if state.faults.query {
            return Err(TransportError::Query(format!("injected on {}", pattern)));
        }

        Ok(state
            .alive
            .keys()
            .filter(|key| keys::matches(pattern, key))
            .map(|key| LivelinessSample {
                key: key.clone(),
                alive: true,
            })
            .collect())
    }
}

#[async_trait]
impl MessageBus for InMemoryFabric {
    async fn subscribe(&self, pattern: &str) -> Result<BoxStream<'static, Sample>> {
        let (tx, rx) = unbounded();
        self.lock().message_subs.push((pattern.to_string(), tx));
        Ok(rx.boxed())
    }
}

#[async_trait]
impl DiscoveryService for InMemoryFabric {
    async fn scan(&self, filter: RoleFilter) -> Result<BoxStream<'static, Hello>> {
        let hellos: Vec<Hello> = self
            .lock()
            .discovery
            .iter()
            .filter(|hello| filter.accepts(NodeRole::infer(&hello.role_hint)))
            .cloned()
            .collect();
        Ok(stream::iter(hellos).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PATTERN: &str = "ns/presence/**";

    async fn open(fabric: &InMemoryFabric, identity: &str) -> Arc<dyn Endpoint> {
        fabric
            .open(&EndpointConfig::new(identity, NodeRole::Peer))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_token_lifecycle_notifies_subscribers() {
        let fabric = InMemoryFabric::new();
        let mut events = PresenceService::subscribe(&fabric, PATTERN, false)
            .await
            .unwrap();

        let endpoint = open(&fabric, "n1").await;
        let token = endpoint.declare_token("ns/presence/n1").await.unwrap();
        assert_eq!(
            events.next().await,
            Some(LivelinessSample {
                key: "ns/presence/n1".into(),
                alive: true
            })
        );

        token.undeclare().await.unwrap();
        token.undeclare().await.unwrap();
        assert_eq!(
            events.next().await,
            Some(LivelinessSample {
                key: "ns/presence/n1".into(),
                alive: false
            })
        );
        assert_eq!(fabric.live_tokens(), 0);
    }

    #[tokio::test]
    async fn test_replay_delivers_current_tokens() {
        let fabric = InMemoryFabric::new();
        fabric.inject_liveliness("ns/presence/a", true);
        fabric.inject_liveliness("other/presence/b", true);

        let mut events = PresenceService::subscribe(&fabric, PATTERN, true)
            .await
            .unwrap();
        let first = events.next().await.unwrap();
        assert_eq!(first.key, "ns/presence/a");
        assert!(first.alive);

        fabric.inject_liveliness("ns/presence/c", true);
        assert_eq!(events.next().await.unwrap().key, "ns/presence/c");
    }

    #[tokio::test]
    async fn test_query_and_forget() {
        let fabric = InMemoryFabric::new();
        fabric.inject_liveliness("ns/presence/a", true);
        fabric.inject_liveliness("ns/presence/b", true);

        let results = fabric.query(PATTERN, Duration::from_secs(1)).await.unwrap();
        assert_eq!(results.len(), 2);

        fabric.forget_liveliness("ns/presence/a");
        let results = fabric.query(PATTERN, Duration::from_secs(1)).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].key, "ns/presence/b");

        fabric.fail_queries(true);
        assert!(fabric.query(PATTERN, Duration::from_secs(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_close_releases_endpoint_resources() {
        let fabric = InMemoryFabric::new();
        let endpoint = open(&fabric, "n1").await;
        let _token = endpoint.declare_token("ns/presence/n1").await.unwrap();
        let publisher = endpoint
            .declare_publisher("ns/heartbeat/n1", Qos::heartbeat())
            .await
            .unwrap();

        endpoint.close().await.unwrap();

        assert_eq!(fabric.open_endpoints(), 0);
        assert_eq!(fabric.live_tokens(), 0);
        assert_eq!(fabric.live_publishers(), 0);
        assert!(!fabric.is_alive("ns/presence/n1"));
        assert!(publisher.publish(b"1".to_vec()).await.is_err());
        assert!(endpoint.declare_token("ns/presence/n1").await.is_err());
    }

    #[tokio::test]
    async fn test_undeclare_and_close_faults() {
        let fabric = InMemoryFabric::new();
        let endpoint = open(&fabric, "n1").await;
        let token = endpoint.declare_token("ns/presence/n1").await.unwrap();
        let publisher = endpoint
            .declare_publisher("ns/heartbeat/n1", Qos::heartbeat())
            .await
            .unwrap();

        fabric.fail_token_undeclares(true);
        fabric.fail_publisher_undeclares(true);
        fabric.fail_closes(true);
        assert!(token.undeclare().await.is_err());
        assert!(publisher.undeclare().await.is_err());
        assert!(endpoint.close().await.is_err());
        assert!(fabric.is_alive("ns/presence/n1"));
        assert_eq!(fabric.live_publishers(), 1);
        assert_eq!(fabric.open_endpoints(), 1);

        fabric.fail_token_undeclares(false);
        fabric.fail_publisher_undeclares(false);
        fabric.fail_closes(false);
        token.undeclare().await.unwrap();
        publisher.undeclare().await.unwrap();
        endpoint.close().await.unwrap();
        assert!(!fabric.is_alive("ns/presence/n1"));
        assert_eq!(fabric.live_publishers(), 0);
        assert_eq!(fabric.open_endpoints(), 0);
    }

    #[tokio::test]
    async fn test_publish_reaches_matching_subscribers() {
        let fabric = InMemoryFabric::new();
        let mut heartbeats = MessageBus::subscribe(&fabric, "ns/heartbeat/*")
            .await
            .unwrap();
        let endpoint = open(&fabric, "n1").await;
        let publisher = endpoint
            .declare_publisher("ns/heartbeat/n1", Qos::heartbeat())
            .await
            .unwrap();

        publisher.publish(b"42".to_vec()).await.unwrap();
        fabric.publish_external("elsewhere/heartbeat/x", b"1");

        let sample = heartbeats.next().await.unwrap();
        assert_eq!(sample.topic, "ns/heartbeat/n1");
        assert_eq!(sample.payload, b"42");
        assert_eq!(fabric.published_count("ns/heartbeat/n1"), 1);

        fabric.fail_publishes(true);
        assert!(publisher.publish(b"43".to_vec()).await.is_err());
        assert_eq!(fabric.published_count("ns/heartbeat/n1"), 1);
    }

    #[tokio::test]
    async fn test_open_faults() {
        let fabric = InMemoryFabric::new();
        fabric.fail_open_for("bad");
        assert!(
            fabric
                .open(&EndpointConfig::new("bad", NodeRole::Peer))
                .await
                .is_err()
        );
        open(&fabric, "good").await;
        assert_eq!(fabric.open_endpoints(), 1);
    }

    #[tokio::test]
    async fn test_scan_filters_roles() {
        let fabric = InMemoryFabric::new();
        fabric.set_discovery(vec![
            Hello::new("router", "tcp/r:7447"),
            Hello::new("peer", "tcp/p:7447"),
            Hello::new("client", "tcp/c:7447"),
        ]);

        let all: Vec<Hello> = fabric
            .scan(RoleFilter::RoutersAndPeers)
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(all.len(), 2);

        let routers: Vec<Hello> = fabric
            .scan(RoleFilter::Routers)
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(routers, vec![Hello::new("router", "tcp/r:7447")]);
    }
}
