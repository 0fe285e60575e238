//! Error types for tunnel operations.

use thiserror::Error;

use super::socket::{Side, SocketState};

/// Errors returned when an operation cannot be started on a tunnel.
///
/// Network failures are never reported through this type: they are recorded
/// on the socket as an [`OpStatus`](super::OpStatus) and handed to the
/// collaborator's completion hook.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TunnelError {
    /// The tunnel has been shut down; no new operation may start.
    #[error("tunnel is terminated")]
    Terminated,

    /// The socket has been closed.
    #[error("{0} socket is closed")]
    SocketClosed(Side),

    /// The socket has no connected stream yet.
    #[error("{0} socket is not connected")]
    NotConnected(Side),

    /// The socket already has a stream or a connect in flight.
    #[error("{0} socket is already connected or connecting")]
    AlreadyConnected(Side),

    /// `connect` was called before a target address was set or resolved.
    #[error("{0} socket has no target address")]
    NoTargetAddress(Side),

    /// A resolution is already pending on this tunnel.
    #[error("a DNS resolution is already pending")]
    ResolvePending,

    /// The operation is not allowed in the socket's current state.
    #[error("cannot {op} on {side} socket in state {state:?}")]
    InvalidState {
        op: &'static str,
        side: Side,
        state: SocketState,
    },

    /// The collaborator rejected the data it was handed.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl TunnelError {
    /// Create a protocol error from a message.
    pub fn protocol(message: impl Into<String>) -> Self {
        TunnelError::Protocol(message.into())
    }
}
