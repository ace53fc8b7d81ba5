use thiserror::Error;

use crate::protocol::ProtocolError;
use tandem_store::StoreError;

/// Errors surfaced by the link layer.
#[derive(Debug, Clone, Error)]
pub enum LinkError {
    /// The requested identity is held by someone else.
    #[error("ID \"{0}\" is taken")]
    IdentityTaken(String),
    /// The rendezvous pipe went away.
    #[error("Signaling connection closed")]
    SignalingClosed,
    #[error("Signaling transport error: {0}")]
    Transport(String),
    #[error("Signaling error: {0}")]
    Rejected(String),
    /// `send` was called with no open data channel.
    #[error("No open data channel; wait for readiness before sending")]
    NoChannel,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Errors from the synchronized store.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Link(#[from] LinkError),
}
