use crate::transport::TransportError;
use thiserror::Error;

/// Errors returned by topology operations.
#[derive(Debug, Error)]
pub enum TopologyError {
    /// The operation is disallowed in the current state (e.g. closing the
    /// primary session). Distinct from a failed attempt.
    #[error("Operation not permitted: {0}")]
    NotPermitted(String),

    #[error("No managed session at index {0}")]
    SessionNotFound(usize),

    #[error("Session already open for identity: {0}")]
    AlreadyOpen(String),

    #[error("Invalid identity: {0:?}")]
    InvalidIdentity(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Topology service is shut down")]
    Closed,
}

pub type Result<T> = std::result::Result<T, TopologyError>;
