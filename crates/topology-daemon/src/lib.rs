//! topology-daemon library: tokio runtime for the topology tracker.
//!
//! Hosts the actor that owns all topology state, the managed session
//! lifecycle, listener tasks, reconciliation and discovery. The binary is
//! a thin CLI over `start`.

pub mod actor;
pub mod config;
pub mod listeners;
pub mod reconciler;
pub mod scanner;
pub mod session;

pub use actor::{Services, TopologyHandle, start};
pub use config::{ConfigError, TopologyConfig, parse_discover_entry};
pub use session::{SessionManager, SessionSignal};
