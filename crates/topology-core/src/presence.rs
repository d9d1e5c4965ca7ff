//! Presence ingestion.
//!
//! Presence events arrive as an ordered stream of alive/dead transitions for
//! keys under `<namespace>/presence/`. Subscriptions replay tokens that are
//! already alive, so existing nodes show up immediately on subscribe.
//!
//! Applying an event is idempotent: the same event twice leaves the store as
//! it was after the first one. No dedup or acknowledgment is needed.

use crate::keys;
use crate::node::NodePatch;
use crate::store::{MembershipStore, Upsert};
use crate::transport::LivelinessSample;

/// A liveliness transition for one identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEvent {
    pub identity: String,
    pub alive: bool,
}

impl PresenceEvent {
    pub fn alive(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            alive: true,
        }
    }

    pub fn dead(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            alive: false,
        }
    }

    /// Decode a liveliness sample, ignoring keys outside `namespace`.
    pub fn from_sample(namespace: &str, sample: &LivelinessSample) -> Option<Self> {
        let identity = keys::presence_identity(namespace, &sample.key)?;
        Some(Self {
            identity: identity.to_string(),
            alive: sample.alive,
        })
    }
}

/// What applying a presence event did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceOutcome {
    /// Unknown identity, created online
    Appeared,
    /// Known node went from offline to online
    CameOnline,
    /// Known node went from online to offline
    WentOffline,
    /// Event matched current state
    Unchanged,
    /// Dead event for an identity we never saw
    Ignored,
}

/// Apply one presence event.
///
/// Alive creates the node if needed (cosmetic fields derived from the
/// identity) and marks it online. Dead marks a known node offline and
/// keeps its history; dead events never create nodes.
pub fn apply(store: &mut MembershipStore, event: &PresenceEvent, now_ms: u64) -> PresenceOutcome {
    if event.alive {
        let created = store.upsert(&event.identity, NodePatch::new(), now_ms) == Upsert::Created;
        let changed = store.set_online(&event.identity, true);
        match (created, changed) {
            (true, _) => PresenceOutcome::Appeared,
            (false, true) => PresenceOutcome::CameOnline,
            (false, false) => PresenceOutcome::Unchanged,
        }
    } else if !store.contains(&event.identity) {
        PresenceOutcome::Ignored
    } else if store.set_online(&event.identity, false) {
        PresenceOutcome::WentOffline
    } else {
        PresenceOutcome::Unchanged
    }
}
