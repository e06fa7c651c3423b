//! Error definitions for the session module

use std::time::Duration;
use thiserror::Error;

use crate::mqtt::mqtt_handler::TransportError;

/// Everything a session operation can fail with. None of these are fatal to
/// the process; they are scoped to the session that produced them.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Broker refused or dropped the connection attempt
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Broker never completed the handshake
    #[error("Connection attempt timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// Publish, subscribe or unsubscribe could not be carried out
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("A toggle request is still pending")]
    TogglePending,

    #[error("No response to discovery request within {0:?}")]
    DiscoveryTimeout(Duration),

    /// The connection went away while a discovery request was waiting
    #[error("Discovery request cancelled")]
    DiscoveryCancelled,

    #[error("Camera server error: {0}")]
    Camera(String),
}
