//! Error types for the lobby layer.

use questline_protocol::ProtocolError;

/// Errors that can occur during lobby operations.
#[derive(Debug, thiserror::Error)]
pub enum LobbyError {
    /// The lobby actor is gone or its command queue is closed.
    #[error("lobby is unavailable")]
    Unavailable,

    /// A lobby notice could not be encoded. Fatal for the lobby.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
