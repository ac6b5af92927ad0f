use std::time::Duration;

use thiserror::Error;

use crate::RemoteFailure;

/// Errors surfaced by proxies, servers and transports.
#[derive(Error, Debug)]
pub enum RpcError {
    /// No correlated response arrived before the call deadline.
    ///
    /// The remote function may still be running; a timeout only means no
    /// answer was observed in time.
    #[error("no response within {0:?}")]
    Timeout(Duration),

    /// The remote function failed. Kind and message are the ones captured by
    /// the server.
    #[error("remote failure: {0}")]
    Remote(RemoteFailure),

    /// Connect, declare, publish or consume failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// The reply subscription closed while a call was waiting.
    #[error("connection lost while waiting for a response")]
    ConnectionLost,

    /// Payload encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A local precondition was violated (empty server id, no target, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A function could not be registered.
    #[error("invalid registration: {0}")]
    InvalidRegistration(String),

    /// Operation not allowed in the server's current lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// An inbound message was not a well-formed request or response.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}

impl RpcError {
    /// `true` for failures reported by the remote side, as opposed to local
    /// or transport conditions.
    pub fn is_remote(&self) -> bool {
        matches!(self, RpcError::Remote(_))
    }

    /// `true` if the call gave up waiting for a response.
    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::Timeout(_))
    }
}

/// Result type alias for RPC operations
pub type Result<T> = std::result::Result<T, RpcError>;
