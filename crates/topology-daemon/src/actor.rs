//! Topology actor: the single owner of topology state.
//!
//! All mutations funnel through one task. Listener tasks, heartbeat timers
//! and callers holding a `TopologyHandle` only send it messages, so no two
//! producers can interleave partial updates.
//!
//! Reconciliation queries and discovery scans run outside the actor (on
//! the caller's task); only applying their results goes through it.

use crate::config::TopologyConfig;
use crate::listeners;
use crate::reconciler;
use crate::scanner;
use crate::session::{SessionManager, SessionSignal};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use topology_core::error::{Result, TopologyError};
use topology_core::events::{EventBus, TopologyEvent};
use topology_core::node::NodeOrigin;
use topology_core::presence::{PresenceEvent, PresenceOutcome};
use topology_core::transport::{
    DiscoveryService, EndpointConfig, EndpointFactory, Hello, MessageBus, PresenceService,
    RoleFilter,
};
use topology_core::{
    DiscoveryReport, InMemoryFabric, ReconcileReport, SessionSummary, Topology, TopologyView,
    now_ms,
};
use tracing::{debug, info};

/// Collaborators the service runs against.
#[derive(Clone)]
pub struct Services {
    pub endpoints: Arc<dyn EndpointFactory>,
    pub presence: Arc<dyn PresenceService>,
    pub messages: Arc<dyn MessageBus>,
    pub discovery: Arc<dyn DiscoveryService>,
}

impl Services {
    /// All four services backed by one in-process fabric.
    pub fn in_memory(fabric: &InMemoryFabric) -> Self {
        Self {
            endpoints: Arc::new(fabric.clone()),
            presence: Arc::new(fabric.clone()),
            messages: Arc::new(fabric.clone()),
            discovery: Arc::new(fabric.clone()),
        }
    }
}

/// Requests handled by the actor.
pub enum Command {
    OpenSession {
        config: EndpointConfig,
        resp: oneshot::Sender<Result<usize>>,
    },
    CloseSession {
        index: usize,
        resp: oneshot::Sender<Result<()>>,
    },
    ApplySnapshot {
        results: Vec<PresenceEvent>,
        resp: oneshot::Sender<ReconcileReport>,
    },
    AddDiscovered {
        hello: Hello,
        resp: oneshot::Sender<Option<String>>,
    },
    ClearDiscovered {
        resp: oneshot::Sender<usize>,
    },
    View {
        resp: oneshot::Sender<TopologyView>,
    },
    Sessions {
        resp: oneshot::Sender<Vec<SessionSummary>>,
    },
    Shutdown {
        resp: oneshot::Sender<()>,
    },
}

/// Messages from the long-lived listener tasks.
#[derive(Debug)]
pub enum Inbound {
    Presence(PresenceEvent),
    Heartbeat { identity: String },
}

pub struct TopologyActor {
    topology: Topology,
    sessions: SessionManager,
    events: Arc<EventBus>,
    commands: mpsc::UnboundedReceiver<Command>,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    signals: mpsc::UnboundedReceiver<SessionSignal>,
    /// Listener tasks and the periodic reconciler
    background: Vec<JoinHandle<()>>,
}

impl TopologyActor {
    /// Process messages until shutdown or until every handle is dropped.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Shutdown { resp }) => {
                        self.shutdown().await;
                        let _ = resp.send(());
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },

                Some(msg) = self.inbound.recv() => {
                    self.handle_inbound(msg);
                }

                Some(signal) = self.signals.recv() => {
                    self.handle_signal(signal);
                }
            }
        }
        debug!("Topology actor stopped");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::OpenSession { config, resp } => {
                let _ = resp.send(self.open_session(config).await);
            }
            Command::CloseSession { index, resp } => {
                let _ = resp.send(self.close_session(index).await);
            }
            Command::ApplySnapshot { results, resp } => {
                let report = self.topology.apply_snapshot(&results, now_ms());
                info!(
                    "Reconciled {} result(s): {} created, {} revived, {} demoted",
                    report.seen,
                    report.created.len(),
                    report.revived.len(),
                    report.demoted.len()
                );
                for identity in &report.created {
                    self.emit(TopologyEvent::NodeAdded {
                        identity: identity.clone(),
                        origin: NodeOrigin::Presence,
                    });
                }
                self.emit(TopologyEvent::Reconciled {
                    seen: report.seen,
                    revived: report.revived.len(),
                    demoted: report.demoted.len(),
                });
                let _ = resp.send(report);
            }
            Command::AddDiscovered { hello, resp } => {
                let added = self.topology.add_discovered(&hello, now_ms());
                if let Some(identity) = &added {
                    debug!("Discovered {} at {}", identity, hello.address);
                    self.emit(TopologyEvent::NodeAdded {
                        identity: identity.clone(),
                        origin: NodeOrigin::Discovered,
                    });
                }
                let _ = resp.send(added);
            }
            Command::ClearDiscovered { resp } => {
                let removed = self.topology.clear_discovered();
                for r in &removed {
                    self.emit(TopologyEvent::NodeRemoved {
                        identity: r.node.identity.clone(),
                    });
                }
                let _ = resp.send(removed.len());
            }
            Command::View { resp } => {
                let _ = resp.send(self.topology.view(self.sessions.summaries()));
            }
            Command::Sessions { resp } => {
                let _ = resp.send(self.sessions.summaries());
            }
            // Handled by the run loop
            Command::Shutdown { resp } => {
                let _ = resp.send(());
            }
        }
    }

    async fn open_session(&mut self, config: EndpointConfig) -> Result<usize> {
        let index = self.sessions.open(&config).await?;

        let existed = self.topology.store().contains(&config.identity);
        let edges = self.topology.add_managed(
            &config.identity,
            config.role,
            config.address(),
            now_ms(),
        );
        debug!("Session {} meshed with {} edge(s)", config.identity, edges);

        if !existed {
            self.emit(TopologyEvent::NodeAdded {
                identity: config.identity.clone(),
                origin: NodeOrigin::Managed,
            });
        }
        self.emit(TopologyEvent::SessionOpened {
            identity: config.identity,
            index,
        });
        Ok(index)
    }

    async fn close_session(&mut self, index: usize) -> Result<()> {
        let identity = self.sessions.close(index).await?;

        if self.topology.remove_managed(&identity).is_some() {
            self.emit(TopologyEvent::NodeRemoved {
                identity: identity.clone(),
            });
        }
        self.emit(TopologyEvent::SessionClosed { identity });
        Ok(())
    }

    fn handle_inbound(&mut self, msg: Inbound) {
        let now = now_ms();
        match msg {
            Inbound::Presence(event) => {
                let outcome = self.topology.apply_presence(&event, now);
                let identity = event.identity;
                match outcome {
                    PresenceOutcome::Appeared => {
                        self.emit(TopologyEvent::NodeAdded {
                            identity: identity.clone(),
                            origin: NodeOrigin::Presence,
                        });
                        self.emit(TopologyEvent::NodeOnline { identity });
                    }
                    PresenceOutcome::CameOnline => {
                        self.emit(TopologyEvent::NodeOnline { identity });
                    }
                    PresenceOutcome::WentOffline => {
                        self.emit(TopologyEvent::NodeOffline { identity });
                    }
                    PresenceOutcome::Unchanged | PresenceOutcome::Ignored => {}
                }
            }
            Inbound::Heartbeat { identity } => {
                if !self.topology.apply_heartbeat(&identity, now) {
                    debug!("Ignoring heartbeat from unknown identity {}", identity);
                    return;
                }
                self.sessions.record_received_except(&identity);
            }
        }
    }

    fn handle_signal(&mut self, signal: SessionSignal) {
        match signal {
            SessionSignal::HeartbeatPublished { identity } => {
                self.sessions.record_sent(&identity);
            }
            SessionSignal::HeartbeatFailed { identity, error } => {
                debug!("Heartbeat publish failed for {}: {}", identity, error);
                self.sessions.record_failure(&identity);
            }
        }
    }

    async fn shutdown(&mut self) {
        info!("Shutting down topology actor");

        for task in self.background.drain(..) {
            task.abort();
            let _ = task.await;
        }

        for identity in self.sessions.shutdown().await {
            let removed = if self.topology.primary() == Some(identity.as_str()) {
                self.topology.release_primary()
            } else {
                self.topology.remove_managed(&identity)
            };
            if removed.is_some() {
                self.emit(TopologyEvent::NodeRemoved {
                    identity: identity.clone(),
                });
            }
            self.emit(TopologyEvent::SessionClosed { identity });
        }
    }

    fn emit(&self, event: TopologyEvent) {
        self.events.emit(event);
    }
}

/// Cloneable handle for talking to a running actor.
#[derive(Clone)]
pub struct TopologyHandle {
    commands: mpsc::UnboundedSender<Command>,
    presence: Arc<dyn PresenceService>,
    discovery: Arc<dyn DiscoveryService>,
    events: Arc<EventBus>,
    namespace: String,
    reconcile_timeout: Duration,
    scan_timeout: Duration,
}

impl TopologyHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .map_err(|_| TopologyError::Closed)?;
        rx.await.map_err(|_| TopologyError::Closed)
    }

    /// Open a managed session. Returns its index; 0 is the primary.
    pub async fn open_session(&self, config: EndpointConfig) -> Result<usize> {
        self.request(|resp| Command::OpenSession { config, resp })
            .await?
    }

    /// Close the managed session at `index`.
    ///
    /// Fails with `NotPermitted` for the primary and `SessionNotFound` for
    /// an index with no session.
    pub async fn close_session(&self, index: usize) -> Result<()> {
        self.request(|resp| Command::CloseSession { index, resp })
            .await?
    }

    /// Run one reconciliation pass.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let results = reconciler::snapshot(
            self.presence.as_ref(),
            &self.namespace,
            self.reconcile_timeout,
        )
        .await?;
        self.apply_snapshot(results).await
    }

    /// Apply snapshot results collected elsewhere.
    pub async fn apply_snapshot(&self, results: Vec<PresenceEvent>) -> Result<ReconcileReport> {
        self.request(|resp| Command::ApplySnapshot { results, resp })
            .await
    }

    /// Run one bounded discovery scan.
    pub async fn scan(&self, filter: RoleFilter) -> Result<DiscoveryReport> {
        let report =
            scanner::run(self, self.discovery.as_ref(), filter, self.scan_timeout).await?;
        self.events.emit(TopologyEvent::DiscoveryCompleted {
            seen: report.seen,
            added: report.added.len(),
        });
        Ok(report)
    }

    /// Insert one discovered peer. Returns its identity if it was new.
    pub async fn add_discovered(&self, hello: Hello) -> Result<Option<String>> {
        self.request(|resp| Command::AddDiscovered { hello, resp })
            .await
    }

    /// Remove every discovered node. Returns how many were removed.
    pub async fn clear_discovered(&self) -> Result<usize> {
        self.request(|resp| Command::ClearDiscovered { resp }).await
    }

    pub async fn view(&self) -> Result<TopologyView> {
        self.request(|resp| Command::View { resp }).await
    }

    pub async fn sessions(&self) -> Result<Vec<SessionSummary>> {
        self.request(|resp| Command::Sessions { resp }).await
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Tear down every session and stop the actor.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|resp| Command::Shutdown { resp }).await
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

/// Start the actor and its listener tasks.
///
/// Presence and heartbeat subscriptions are established before this
/// returns, so nodes already alive are replayed into the store.
pub async fn start(config: TopologyConfig, services: Services) -> Result<TopologyHandle> {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (signal_tx, signal_rx) = mpsc::unbounded_channel();

    let presence_task = listeners::spawn_presence(
        services.presence.as_ref(),
        &config.namespace,
        inbound_tx.clone(),
    )
    .await?;
    let heartbeat_task = match listeners::spawn_heartbeats(
        services.messages.as_ref(),
        &config.namespace,
        inbound_tx,
    )
    .await
    {
        Ok(task) => task,
        Err(e) => {
            presence_task.abort();
            return Err(e);
        }
    };
    let mut background = vec![presence_task, heartbeat_task];

    let events = Arc::new(EventBus::new());
    let handle = TopologyHandle {
        commands: command_tx,
        presence: Arc::clone(&services.presence),
        discovery: Arc::clone(&services.discovery),
        events: Arc::clone(&events),
        namespace: config.namespace.clone(),
        reconcile_timeout: config.reconcile_timeout,
        scan_timeout: config.scan_timeout,
    };

    if let Some(period) = config.reconcile_interval {
        background.push(reconciler::spawn_periodic(handle.clone(), period));
    } else {
        debug!("Periodic reconciliation disabled");
    }

    let actor = TopologyActor {
        topology: Topology::new(config.layout),
        sessions: SessionManager::new(
            Arc::clone(&services.endpoints),
            config.namespace.clone(),
            config.heartbeat_interval,
            signal_tx,
        ),
        events,
        commands: command_rx,
        inbound: inbound_rx,
        signals: signal_rx,
        background,
    };
    tokio::spawn(actor.run());

    info!("Topology actor started on namespace {}", config.namespace);
    Ok(handle)
}
