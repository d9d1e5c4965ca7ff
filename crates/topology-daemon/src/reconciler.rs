//! Snapshot queries for reconciliation.
//!
//! The query runs on the caller's task, bounded by the configured timeout.
//! Only the resulting snapshot is handed to the actor.

use crate::actor::TopologyHandle;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use topology_core::TopologyError;
use topology_core::error::Result;
use topology_core::keys;
use topology_core::presence::PresenceEvent;
use topology_core::transport::PresenceService;
use tracing::{debug, warn};

/// Extra time the guard allows past the service's own query timeout.
const QUERY_GRACE: Duration = Duration::from_millis(500);

/// Collect a full membership snapshot.
///
/// Hitting the timeout is not an error: whatever arrived (possibly nothing)
/// is returned. A failed query is an error, and nothing gets applied.
pub async fn snapshot(
    presence: &dyn PresenceService,
    namespace: &str,
    timeout: Duration,
) -> Result<Vec<PresenceEvent>> {
    let pattern = keys::presence_pattern(namespace);

    // The service bounds its own query; this guards against one that doesn't
    let guard = timeout + QUERY_GRACE;
    let samples = match tokio::time::timeout(guard, presence.query(&pattern, timeout)).await {
        Ok(samples) => samples?,
        Err(_) => {
            warn!("Snapshot query on {} did not return within {:?}", pattern, guard);
            Vec::new()
        }
    };

    let results: Vec<PresenceEvent> = samples
        .iter()
        .filter_map(|sample| PresenceEvent::from_sample(namespace, sample))
        .collect();
    debug!("Snapshot on {} returned {} result(s)", pattern, results.len());
    Ok(results)
}

/// Reconcile every `period` until the actor shuts down.
pub fn spawn_periodic(handle: TopologyHandle, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            match handle.reconcile().await {
                Ok(_) => {}
                Err(TopologyError::Closed) => break,
                Err(e) => warn!("Periodic reconciliation failed: {}", e),
            }
        }
    })
}
