//! Runtime configuration for the topology service.

use std::time::Duration;
use thiserror::Error;
use topology_core::graph::LayoutParams;
use topology_core::transport::Hello;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("Invalid discovery entry {0:?}, expected <role>@<address>")]
    InvalidDiscoverEntry(String),

    #[error("Invalid namespace {0:?}")]
    InvalidNamespace(String),

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
}

/// Configuration for the topology actor and its background tasks.
#[derive(Debug, Clone)]
pub struct TopologyConfig {
    /// Key prefix shared by every participant
    pub namespace: String,
    /// Period of each managed session's heartbeat timer
    pub heartbeat_interval: Duration,
    /// Upper bound on one reconciliation snapshot query
    pub reconcile_timeout: Duration,
    /// Period of automatic reconciliation (None = on demand only)
    pub reconcile_interval: Option<Duration>,
    /// Upper bound on one discovery scan
    pub scan_timeout: Duration,
    pub layout: LayoutParams,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            namespace: "topology".to_string(),
            heartbeat_interval: Duration::from_secs(2),
            reconcile_timeout: Duration::from_secs(3),
            reconcile_interval: Some(Duration::from_secs(10)),
            scan_timeout: Duration::from_secs(3),
            layout: LayoutParams::default(),
        }
    }
}

impl TopologyConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.namespace.is_empty()
            || self.namespace.starts_with('/')
            || self.namespace.ends_with('/')
            || self.namespace.contains(['*', '$'])
        {
            return Err(ConfigError::InvalidNamespace(self.namespace.clone()));
        }

        let durations = [
            ("heartbeat_interval", Some(self.heartbeat_interval)),
            ("reconcile_timeout", Some(self.reconcile_timeout)),
            ("reconcile_interval", self.reconcile_interval),
            ("scan_timeout", Some(self.scan_timeout)),
        ];
        for (name, duration) in durations {
            if duration == Some(Duration::ZERO) {
                return Err(ConfigError::ZeroDuration(name));
            }
        }
        Ok(())
    }
}

/// Parse a `<role>@<address>` discovery entry.
pub fn parse_discover_entry(entry: &str) -> Result<Hello, ConfigError> {
    match entry.split_once('@') {
        Some((role, address)) if !role.is_empty() && !address.is_empty() => {
            Ok(Hello::new(role, address))
        }
        _ => Err(ConfigError::InvalidDiscoverEntry(entry.to_string())),
    }
}
