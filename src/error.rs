//! Error kinds that callers branch on.
//!
//! Most plumbing returns `anyhow::Result`. These enums exist where the caller must
//! distinguish the failure: the HTTP layer maps `BridgeError` to a status code, and the
//! sync loop uses `CloudError` to tell an outage apart from a rejected item.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    /// The node has no live WebSocket connection.
    #[error("node '{0}' is offline")]
    NodeOffline(String),

    #[error("node '{0}' is not registered")]
    UnknownNode(String),

    /// Contract violation by the caller (missing field, malformed body).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The node event queue is full; the node should retry later.
    #[error("node event queue is full")]
    Busy,

    /// The downstream consumer of node events has gone away.
    #[error("node event channel closed")]
    ChannelClosed,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl BridgeError {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest(_) => 400,
            Self::UnknownNode(_) => 404,
            Self::NodeOffline(_) => 409,
            Self::Busy | Self::ChannelClosed => 503,
            Self::Internal(_) => 500,
        }
    }
}

#[derive(Debug, Error)]
pub enum CloudError {
    /// Network-level failure: DNS, connect, timeout.
    #[error("cloud unreachable: {0}")]
    Unreachable(String),

    /// The cloud answered with a non-success status.
    #[error("cloud returned status {status}: {body}")]
    Status { status: u16, body: String },

    /// The response could not be interpreted.
    #[error("invalid cloud response: {0}")]
    InvalidResponse(String),
}
