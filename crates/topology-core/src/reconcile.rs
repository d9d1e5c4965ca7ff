//! Snapshot reconciliation (anti-entropy).
//!
//! Push-based presence can drift: a lost delete leaves a node online
//! forever, a missed put leaves it offline. Reconciliation corrects drift
//! with a full resync:
//!
//! 1. Query a full membership snapshot with a bounded timeout
//! 2. Collect whatever arrived before the timeout (possibly nothing)
//! 3. Mark every node in the store offline (pessimistic reset)
//! 4. Mark every returned identity online
//!
//! Steps 1-2 are the caller's (they need a runtime). This module does 3-4.
//!
//! The reset is intentional. It may race with live presence events: an
//! alive event landing between the query and the apply can be overwritten
//! by the reset, and stays wrong until the next live event or
//! reconciliation. Writes are last-writer-wins per identity.

use crate::node::NodePatch;
use crate::presence::PresenceEvent;
use crate::store::{MembershipStore, Upsert};
use serde::Serialize;
use std::collections::HashSet;

/// Summary of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    /// Results in the snapshot
    pub seen: usize,
    /// Identities created by this pass
    pub created: Vec<String>,
    /// Known nodes that were offline and are now online
    pub revived: Vec<String>,
    /// Nodes that were online and are now offline
    pub demoted: Vec<String>,
}

/// Apply a snapshot to the store.
///
/// Applying the same snapshot twice in a row yields the same store state.
pub fn apply_snapshot(
    store: &mut MembershipStore,
    results: &[PresenceEvent],
    now_ms: u64,
) -> ReconcileReport {
    let previously_online: HashSet<String> = store
        .iter()
        .filter(|n| n.online)
        .map(|n| n.identity.clone())
        .collect();

    store.mark_all_offline();

    let mut report = ReconcileReport {
        seen: results.len(),
        ..Default::default()
    };

    for result in results {
        if !result.alive {
            // Already offline after the reset
            continue;
        }
        if store.upsert(&result.identity, NodePatch::new(), now_ms) == Upsert::Created {
            report.created.push(result.identity.clone());
        } else if !previously_online.contains(&result.identity)
            && !store.is_online(&result.identity)
        {
            report.revived.push(result.identity.clone());
        }
        store.set_online(&result.identity, true);
    }

    report.demoted = store
        .identities()
        .filter(|id| previously_online.contains(*id) && !store.is_online(id))
        .map(str::to_string)
        .collect();

    report
}
