//! Error types for the transport layer.

use crate::address::SimulatorAddress;
use thiserror::Error;

/// Raised when a connection cannot be (re-)established.
#[derive(Debug, Clone, Error)]
#[error("Could not connect to {endpoint} after {attempts} attempt(s): {reason}")]
pub struct ConnectError {
    /// Where we tried to connect to
    pub endpoint: String,

    /// How many dials were made
    pub attempts: u32,

    /// Cause of the final failed attempt
    pub reason: String,
}

/// Errors that can occur while moving messages between processes.
///
/// Every outstanding [`ResponseFuture`](crate::ResponseFuture) completes with
/// one of these instead of hanging when its link goes away.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The connection dropped while the operation was in flight
    #[error("Connection to {peer} lost: {reason}")]
    Disconnected {
        peer: SimulatorAddress,
        reason: String,
    },

    /// Connecting (or reconnecting) exhausted its attempts
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// No link exists towards the requested endpoint
    #[error("No route to {0}")]
    Unreachable(SimulatorAddress),

    /// A frame could not be encoded or decoded
    #[error("Codec error: {0}")]
    Codec(String),

    /// An I/O error outside of an established link
    #[error("I/O error: {0}")]
    Io(String),

    /// No response arrived in time
    #[error("Timeout after {0}ms")]
    Timeout(u64),

    /// The transport has been shut down
    #[error("Transport is closed")]
    Closed,
}

impl TransportError {
    /// Creates a disconnection error.
    pub fn disconnected(peer: SimulatorAddress, reason: impl Into<String>) -> Self {
        Self::Disconnected {
            peer,
            reason: reason.into(),
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        TransportError::Codec(err.to_string())
    }
}
