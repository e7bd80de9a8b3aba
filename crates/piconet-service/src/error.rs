//! Service error types.

use piconet_wire::WireError;
use thiserror::Error;

/// Errors surfaced by the PicoNet service API.
#[derive(Error, Debug)]
pub enum ServiceError {
    /// A wrapped wire-layer error.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// The configuration is unusable.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Event names must contain at least one non-whitespace character.
    #[error("Invalid event name: {0:?}")]
    InvalidEventName(String),

    /// The peer is not (or no longer) connected.
    #[error("Peer not connected: {0}")]
    PeerNotConnected(String),

    /// The operation needs a running service.
    #[error("Service is not running")]
    NotRunning,
}

/// Alias for service results.
pub type ServiceResult<T> = Result<T, ServiceError>;
