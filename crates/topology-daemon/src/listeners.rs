//! Long-lived listener tasks.
//!
//! Each listener owns one subscription stream and forwards decoded
//! messages to the actor. A listener ends when its stream ends or the actor
//! goes away; the actor aborts them during shutdown.

use crate::actor::Inbound;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use topology_core::error::Result;
use topology_core::heartbeat;
use topology_core::keys;
use topology_core::presence::PresenceEvent;
use topology_core::transport::{MessageBus, PresenceService};
use tracing::{debug, warn};

/// Subscribe to presence with replay and forward events to the actor.
pub async fn spawn_presence(
    presence: &dyn PresenceService,
    namespace: &str,
    inbound: mpsc::UnboundedSender<Inbound>,
) -> Result<JoinHandle<()>> {
    let pattern = keys::presence_pattern(namespace);
    let mut stream = presence.subscribe(&pattern, true).await?;
    debug!("Subscribed to presence on {}", pattern);

    let namespace = namespace.to_string();
    Ok(tokio::spawn(async move {
        while let Some(sample) = stream.next().await {
            let Some(event) = PresenceEvent::from_sample(&namespace, &sample) else {
                debug!("Ignoring liveliness key {}", sample.key);
                continue;
            };
            if inbound.send(Inbound::Presence(event)).is_err() {
                break;
            }
        }
        warn!("Presence subscription on {} ended", pattern);
    }))
}

/// Subscribe to heartbeats and forward sender identities to the actor.
pub async fn spawn_heartbeats(
    messages: &dyn MessageBus,
    namespace: &str,
    inbound: mpsc::UnboundedSender<Inbound>,
) -> Result<JoinHandle<()>> {
    let pattern = keys::heartbeat_pattern(namespace);
    let mut stream = messages.subscribe(&pattern).await?;
    debug!("Subscribed to heartbeats on {}", pattern);

    let namespace = namespace.to_string();
    Ok(tokio::spawn(async move {
        while let Some(sample) = stream.next().await {
            let Some(identity) = heartbeat::sender(&namespace, &sample) else {
                debug!("Ignoring heartbeat on {}", sample.topic);
                continue;
            };
            if heartbeat::decode(&sample.payload).is_none() {
                debug!("Malformed heartbeat payload from {}", identity);
            }
            if inbound.send(Inbound::Heartbeat { identity }).is_err() {
                break;
            }
        }
        debug!("Heartbeat subscription on {} ended", pattern);
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;
    use topology_core::InMemoryFabric;

    #[tokio::test]
    async fn test_presence_listener_replays_and_filters() {
        let fabric = InMemoryFabric::new();
        fabric.inject_liveliness("ns/presence/n1", true);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let task = spawn_presence(&fabric, "ns", tx).await.unwrap();
        fabric.inject_liveliness("other/presence/x", true);
        fabric.inject_liveliness("ns/presence/n1", false);

        let first = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert!(matches!(first, Some(Inbound::Presence(e)) if e == PresenceEvent::alive("n1")));
        let second = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert!(matches!(second, Some(Inbound::Presence(e)) if e == PresenceEvent::dead("n1")));

        task.abort();
    }

    #[tokio::test]
    async fn test_heartbeat_listener_resolves_sender() {
        let fabric = InMemoryFabric::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let task = spawn_heartbeats(&fabric, "ns", tx).await.unwrap();
        fabric.publish_external("ns/heartbeat/n2", b"1700000000000");

        let msg = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert!(matches!(msg, Some(Inbound::Heartbeat { identity }) if identity == "n2"));

        task.abort();
    }
}
