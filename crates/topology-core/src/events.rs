//! Event infrastructure for topology changes.
//!
//! Provides `TopologyEvent` for monitoring and `EventBus` for subscriptions.
//! Callbacks run synchronously on the thread that emits, which is the
//! topology owner; keep them short.

use crate::node::NodeOrigin;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Topology changes emitted by the owner.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TopologyEvent {
    /// Node entered the store.
    NodeAdded { identity: String, origin: NodeOrigin },
    /// Node left the store (session closed or discovery cleared).
    NodeRemoved { identity: String },
    /// Node reported alive.
    NodeOnline { identity: String },
    /// Node reported dead or missing from a snapshot.
    NodeOffline { identity: String },
    /// Managed session finished opening.
    SessionOpened { identity: String, index: usize },
    /// Managed session finished tearing down.
    SessionClosed { identity: String },
    /// Reconciliation pass applied.
    Reconciled {
        seen: usize,
        revived: usize,
        demoted: usize,
    },
    /// Discovery scan ended.
    DiscoveryCompleted { seen: usize, added: usize },
}

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Follows the disposer pattern: hold this value to keep receiving events,
/// drop it (or let it go out of scope) to unsubscribe.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

type Callback = Arc<dyn Fn(TopologyEvent) + Send + Sync>;

/// Event bus for publishing topology events to subscribers.
///
/// Wrap in `Arc` to enable subscriptions.
#[derive(Default)]
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, Callback)>>,
    next_id: AtomicUsize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(TopologyEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        // try_write: Drop may run during unwinding while emit holds a read lock
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: TopologyEvent) {
        // Snapshot callbacks so a callback may subscribe without deadlocking
        let callbacks: Vec<Callback> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event.clone());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}
