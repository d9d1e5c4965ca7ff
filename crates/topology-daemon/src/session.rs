//! Managed session lifecycle.
//!
//! A managed session is one endpoint this process owns: the endpoint
//! itself, a presence token announcing it, a heartbeat publisher and the
//! timer task driving that publisher. Sessions move through
//! `Closed -> Opening -> Open -> Closing -> Closed`.
//!
//! Teardown releases resources in a fixed order: timer first, then token,
//! publisher and endpoint. Each step is best-effort; a failing step is
//! logged and the remaining steps still run. The same teardown rolls back
//! a session whose open failed halfway.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use topology_core::error::{Result, TopologyError};
use topology_core::heartbeat;
use topology_core::keys;
use topology_core::node::NodeRole;
use topology_core::transport::{
    Endpoint, EndpointConfig, EndpointFactory, PresenceToken, Publisher, Qos,
};
use topology_core::view::{SessionState, SessionSummary};
use topology_core::now_ms;
use tracing::{debug, info, warn};

/// Outcome of one heartbeat tick, sent back to the owner.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionSignal {
    HeartbeatPublished { identity: String },
    HeartbeatFailed { identity: String, error: String },
}

/// One locally owned endpoint and its resources.
pub struct ManagedSession {
    identity: String,
    role: NodeRole,
    address: Option<String>,
    state: SessionState,
    endpoint: Option<Arc<dyn Endpoint>>,
    token: Option<Box<dyn PresenceToken>>,
    publisher: Option<Arc<dyn Publisher>>,
    timer: Option<JoinHandle<()>>,
    messages_sent: u64,
    messages_received: u64,
    publish_failures: u64,
    created_at: u64,
}

impl ManagedSession {
    fn new(config: &EndpointConfig) -> Self {
        Self {
            identity: config.identity.clone(),
            role: config.role,
            address: config.address().map(str::to_string),
            state: SessionState::Closed,
            endpoint: None,
            token: None,
            publisher: None,
            timer: None,
            messages_sent: 0,
            messages_received: 0,
            publish_failures: 0,
            created_at: now_ms(),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Release every held resource. Safe to call more than once.
    async fn teardown(&mut self) {
        self.state = SessionState::Closing;

        // Stop producing before anything it publishes through goes away
        if let Some(timer) = self.timer.take() {
            timer.abort();
            let _ = timer.await;
        }

        if let Some(token) = self.token.take()
            && let Err(e) = token.undeclare().await
        {
            warn!("Failed to undeclare presence token for {}: {}", self.identity, e);
        }

        if let Some(publisher) = self.publisher.take()
            && let Err(e) = publisher.undeclare().await
        {
            warn!("Failed to undeclare heartbeat publisher for {}: {}", self.identity, e);
        }

        if let Some(endpoint) = self.endpoint.take()
            && let Err(e) = endpoint.close().await
        {
            warn!("Failed to close endpoint for {}: {}", self.identity, e);
        }

        self.state = SessionState::Closed;
    }

    fn summary(&self, index: usize) -> SessionSummary {
        SessionSummary {
            index,
            identity: self.identity.clone(),
            role: self.role,
            endpoint: self.address.clone(),
            state: self.state,
            primary: index == 0,
            messages_sent: self.messages_sent,
            messages_received: self.messages_received,
            publish_failures: self.publish_failures,
            created_at: self.created_at,
        }
    }
}

impl Drop for ManagedSession {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Spawn the fixed-period heartbeat timer for one session.
///
/// The first tick fires one period after start. Ticks that elapse while a
/// publish is still in flight are skipped.
fn spawn_heartbeat_timer(
    identity: String,
    publisher: Arc<dyn Publisher>,
    period: Duration,
    signals: mpsc::UnboundedSender<SessionSignal>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            let signal = match publisher.publish(heartbeat::encode(now_ms())).await {
                Ok(()) => SessionSignal::HeartbeatPublished {
                    identity: identity.clone(),
                },
                Err(e) => SessionSignal::HeartbeatFailed {
                    identity: identity.clone(),
                    error: e.to_string(),
                },
            };
            if signals.send(signal).is_err() {
                break;
            }
        }
    })
}

/// Owns the managed sessions. Index 0 is the primary.
pub struct SessionManager {
    factory: Arc<dyn EndpointFactory>,
    namespace: String,
    heartbeat_interval: Duration,
    signals: mpsc::UnboundedSender<SessionSignal>,
    sessions: Vec<ManagedSession>,
}

impl SessionManager {
    pub fn new(
        factory: Arc<dyn EndpointFactory>,
        namespace: impl Into<String>,
        heartbeat_interval: Duration,
        signals: mpsc::UnboundedSender<SessionSignal>,
    ) -> Self {
        Self {
            factory,
            namespace: namespace.into(),
            heartbeat_interval,
            signals,
            sessions: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.sessions.iter().any(|s| s.identity == identity)
    }

    /// Open a session and register it. Returns its index.
    ///
    /// On failure every resource acquired so far is released and nothing
    /// is registered.
    pub async fn open(&mut self, config: &EndpointConfig) -> Result<usize> {
        if !keys::is_valid_identity(&config.identity) {
            return Err(TopologyError::InvalidIdentity(config.identity.clone()));
        }
        if self.contains(&config.identity) {
            return Err(TopologyError::AlreadyOpen(config.identity.clone()));
        }

        let mut session = ManagedSession::new(config);
        session.state = SessionState::Opening;

        if let Err(e) = self.acquire(&mut session, config).await {
            warn!("Opening session {} failed, rolling back: {}", config.identity, e);
            session.teardown().await;
            return Err(e);
        }

        session.state = SessionState::Open;
        self.sessions.push(session);
        let index = self.sessions.len() - 1;
        info!("Opened session {} at index {}", config.identity, index);
        Ok(index)
    }

    async fn acquire(&self, session: &mut ManagedSession, config: &EndpointConfig) -> Result<()> {
        let endpoint = self.factory.open(config).await?;
        debug!("Endpoint {} opened for {}", endpoint.id(), config.identity);
        session.endpoint = Some(Arc::clone(&endpoint));

        let presence_key = keys::presence_key(&self.namespace, &config.identity);
        session.token = Some(endpoint.declare_token(&presence_key).await?);

        let topic = keys::heartbeat_key(&self.namespace, &config.identity);
        let publisher = endpoint.declare_publisher(&topic, Qos::heartbeat()).await?;
        session.publisher = Some(Arc::clone(&publisher));

        session.timer = Some(spawn_heartbeat_timer(
            config.identity.clone(),
            publisher,
            self.heartbeat_interval,
            self.signals.clone(),
        ));
        Ok(())
    }

    /// Tear down and unregister the session at `index`. Returns its identity.
    ///
    /// The primary (index 0) cannot be closed this way.
    pub async fn close(&mut self, index: usize) -> Result<String> {
        if index >= self.sessions.len() {
            return Err(TopologyError::SessionNotFound(index));
        }
        if index == 0 {
            return Err(TopologyError::NotPermitted(
                "the primary session cannot be closed".to_string(),
            ));
        }

        let mut session = self.sessions.remove(index);
        session.teardown().await;
        info!("Closed session {}", session.identity);
        Ok(session.identity.clone())
    }

    /// Tear down every session, primary last. Returns identities in
    /// teardown order.
    pub async fn shutdown(&mut self) -> Vec<String> {
        let mut closed = Vec::with_capacity(self.sessions.len());
        while let Some(mut session) = self.sessions.pop() {
            session.teardown().await;
            closed.push(session.identity.clone());
        }
        closed
    }

    pub fn record_sent(&mut self, identity: &str) {
        if let Some(session) = self.get_mut(identity) {
            session.messages_sent += 1;
        }
    }

    pub fn record_failure(&mut self, identity: &str) {
        if let Some(session) = self.get_mut(identity) {
            session.publish_failures += 1;
        }
    }

    /// Count a heartbeat from `sender` on every other local session.
    pub fn record_received_except(&mut self, sender: &str) {
        for session in self.sessions.iter_mut().filter(|s| s.identity != sender) {
            session.messages_received += 1;
        }
    }

    pub fn summaries(&self) -> Vec<SessionSummary> {
        self.sessions
            .iter()
            .enumerate()
            .map(|(index, session)| session.summary(index))
            .collect()
    }

    fn get_mut(&mut self, identity: &str) -> Option<&mut ManagedSession> {
        self.sessions.iter_mut().find(|s| s.identity == identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use topology_core::InMemoryFabric;
    use topology_core::transport::{self, TransportError};

    fn manager(fabric: &InMemoryFabric) -> (SessionManager, mpsc::UnboundedReceiver<SessionSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = SessionManager::new(
            Arc::new(fabric.clone()),
            "ns",
            Duration::from_secs(3600),
            tx,
        );
        (manager, rx)
    }

    fn config(identity: &str) -> EndpointConfig {
        EndpointConfig::new(identity, NodeRole::Peer).listen("tcp/0.0.0.0:7447")
    }

    #[tokio::test]
    async fn test_open_declares_resources() {
        let fabric = InMemoryFabric::new();
        let (mut manager, _rx) = manager(&fabric);

        assert_eq!(manager.open(&config("n1")).await.unwrap(), 0);
        assert_eq!(manager.open(&config("n2")).await.unwrap(), 1);

        assert_eq!(fabric.open_endpoints(), 2);
        assert_eq!(fabric.live_tokens(), 2);
        assert_eq!(fabric.live_publishers(), 2);
        assert!(fabric.is_alive("ns/presence/n1"));

        let summaries = manager.summaries();
        assert!(summaries[0].primary);
        assert!(!summaries[1].primary);
        assert_eq!(summaries[1].state, SessionState::Open);
        assert_eq!(summaries[1].endpoint.as_deref(), Some("tcp/0.0.0.0:7447"));
    }

    #[tokio::test]
    async fn test_open_rejects_duplicates_and_bad_identities() {
        let fabric = InMemoryFabric::new();
        let (mut manager, _rx) = manager(&fabric);
        manager.open(&config("n1")).await.unwrap();

        assert!(matches!(
            manager.open(&config("n1")).await,
            Err(TopologyError::AlreadyOpen(_))
        ));
        assert!(matches!(
            manager.open(&config("a/b")).await,
            Err(TopologyError::InvalidIdentity(_))
        ));
        assert_eq!(fabric.open_endpoints(), 1);
    }

    #[tokio::test]
    async fn test_failed_open_rolls_back() {
        let fabric = InMemoryFabric::new();
        let (mut manager, _rx) = manager(&fabric);

        fabric.fail_publisher_declarations(true);
        assert!(matches!(
            manager.open(&config("n1")).await,
            Err(TopologyError::Transport(_))
        ));

        assert!(manager.is_empty());
        assert_eq!(fabric.open_endpoints(), 0);
        assert_eq!(fabric.live_tokens(), 0);
        assert_eq!(fabric.live_publishers(), 0);
        assert!(!fabric.is_alive("ns/presence/n1"));
    }

    #[tokio::test]
    async fn test_close_rules() {
        let fabric = InMemoryFabric::new();
        let (mut manager, _rx) = manager(&fabric);
        manager.open(&config("n1")).await.unwrap();
        manager.open(&config("n2")).await.unwrap();

        assert!(matches!(
            manager.close(0).await,
            Err(TopologyError::NotPermitted(_))
        ));
        assert!(matches!(
            manager.close(5).await,
            Err(TopologyError::SessionNotFound(5))
        ));
        assert_eq!(manager.len(), 2);

        assert_eq!(manager.close(1).await.unwrap(), "n2");
        assert_eq!(manager.len(), 1);
        assert_eq!(fabric.open_endpoints(), 1);
        assert!(!fabric.is_alive("ns/presence/n2"));
    }

    #[tokio::test]
    async fn test_shutdown_closes_primary_last() {
        let fabric = InMemoryFabric::new();
        let (mut manager, _rx) = manager(&fabric);
        for id in ["n1", "n2", "n3"] {
            manager.open(&config(id)).await.unwrap();
        }

        assert_eq!(manager.shutdown().await, vec!["n3", "n2", "n1"]);
        assert!(manager.is_empty());
        assert_eq!(fabric.open_endpoints(), 0);
        assert_eq!(fabric.live_tokens(), 0);
    }

    #[tokio::test]
    async fn test_failed_teardown_step_does_not_skip_the_rest() {
        let fabric = InMemoryFabric::new();
        let (mut manager, _rx) = manager(&fabric);
        manager.open(&config("n1")).await.unwrap();
        manager.open(&config("n2")).await.unwrap();

        fabric.fail_token_undeclares(true);
        assert_eq!(manager.close(1).await.unwrap(), "n2");

        // The endpoint close takes the stuck token with it
        assert_eq!(fabric.live_publishers(), 1);
        assert_eq!(fabric.open_endpoints(), 1);
        assert_eq!(fabric.live_tokens(), 1);
        assert!(!fabric.is_alive("ns/presence/n2"));
        assert!(fabric.is_alive("ns/presence/n1"));
    }

    #[tokio::test]
    async fn test_failed_close_still_releases_token_and_publisher() {
        let fabric = InMemoryFabric::new();
        let (mut manager, _rx) = manager(&fabric);
        manager.open(&config("n1")).await.unwrap();

        fabric.fail_publisher_undeclares(true);
        fabric.fail_closes(true);
        assert_eq!(manager.shutdown().await, vec!["n1"]);

        assert!(manager.is_empty());
        assert_eq!(fabric.live_tokens(), 0);
        assert!(!fabric.is_alive("ns/presence/n1"));
    }

    /// Endpoint stack that records every lifecycle call in order.
    #[derive(Clone, Default)]
    struct Recorder {
        calls: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Recorder {
        fn push(&self, call: &'static str) {
            self.calls.lock().unwrap().push(call);
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }
    }

    /// Records when an in-flight publish is dropped by the timer abort.
    struct PublishGuard(Recorder);

    impl Drop for PublishGuard {
        fn drop(&mut self) {
            self.0.push("publish dropped");
        }
    }

    #[async_trait]
    impl EndpointFactory for Recorder {
        async fn open(&self, _config: &EndpointConfig) -> transport::Result<Arc<dyn Endpoint>> {
            self.push("open");
            Ok(Arc::new(self.clone()))
        }
    }

    #[async_trait]
    impl Endpoint for Recorder {
        fn id(&self) -> &str {
            "recorder"
        }

        async fn declare_token(&self, _key: &str) -> transport::Result<Box<dyn PresenceToken>> {
            self.push("declare token");
            Ok(Box::new(self.clone()))
        }

        async fn declare_publisher(
            &self,
            _topic: &str,
            _qos: Qos,
        ) -> transport::Result<Arc<dyn Publisher>> {
            self.push("declare publisher");
            Ok(Arc::new(self.clone()))
        }

        async fn close(&self) -> transport::Result<()> {
            self.push("close endpoint");
            Ok(())
        }
    }

    #[async_trait]
    impl PresenceToken for Recorder {
        fn key(&self) -> &str {
            "ns/presence/n1"
        }

        async fn undeclare(&self) -> transport::Result<()> {
            self.push("undeclare token");
            Err(TransportError::Declaration("token stuck".into()))
        }
    }

    #[async_trait]
    impl Publisher for Recorder {
        fn topic(&self) -> &str {
            "ns/heartbeat/n1"
        }

        // Never completes, so the timer is always mid-publish at teardown
        async fn publish(&self, _payload: Vec<u8>) -> transport::Result<()> {
            let _guard = PublishGuard(self.clone());
            self.push("publish");
            futures::future::pending().await
        }

        async fn undeclare(&self) -> transport::Result<()> {
            self.push("undeclare publisher");
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_teardown_stops_timer_before_undeclaring() {
        let recorder = Recorder::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut manager = SessionManager::new(
            Arc::new(recorder.clone()),
            "ns",
            Duration::from_millis(5),
            tx,
        );
        manager.open(&config("n1")).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while !recorder.calls().contains(&"publish") {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        manager.shutdown().await;
        assert_eq!(
            recorder.calls(),
            vec![
                "open",
                "declare token",
                "declare publisher",
                "publish",
                "publish dropped",
                "undeclare token",
                "undeclare publisher",
                "close endpoint",
            ]
        );
    }

    #[tokio::test]
    async fn test_timer_reports_publishes() {
        let fabric = InMemoryFabric::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut manager =
            SessionManager::new(Arc::new(fabric.clone()), "ns", Duration::from_millis(10), tx);
        manager.open(&config("n1")).await.unwrap();

        let signal = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            signal,
            SessionSignal::HeartbeatPublished {
                identity: "n1".into()
            }
        );

        fabric.fail_publishes(true);
        loop {
            let signal = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            if matches!(signal, SessionSignal::HeartbeatFailed { .. }) {
                break;
            }
        }
        manager.shutdown().await;
    }

    #[test]
    fn test_counters() {
        let fabric = InMemoryFabric::new();
        let (mut manager, _rx) = manager(&fabric);
        manager.sessions.push(ManagedSession::new(&config("n1")));
        manager.sessions.push(ManagedSession::new(&config("n2")));

        manager.record_sent("n1");
        manager.record_failure("n2");
        manager.record_received_except("n1");
        manager.record_sent("ghost");

        let summaries = manager.summaries();
        assert_eq!(summaries[0].messages_sent, 1);
        assert_eq!(summaries[0].messages_received, 0);
        assert_eq!(summaries[1].publish_failures, 1);
        assert_eq!(summaries[1].messages_received, 1);
    }
}
