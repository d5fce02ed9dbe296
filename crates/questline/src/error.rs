//! Unified error type for Questline.

use questline_lobby::LobbyError;
use questline_protocol::ProtocolError;
use questline_session::{CheckpointError, SessionError};
use questline_transport::TransportError;

/// Top-level error that wraps all crate-specific errors.
///
/// The `#[from]` attribute on each variant lets `?` convert sub-crate
/// errors automatically.
#[derive(Debug, thiserror::Error)]
pub enum QuestlineError {
    /// A transport-level error (bind, accept, send, recv).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A protocol-level error (encode, decode, invalid message).
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A session-level error.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// A checkpoint store error.
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    /// A lobby-level error.
    #[error(transparent)]
    Lobby(#[from] LobbyError),
}
