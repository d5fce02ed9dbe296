//! Error types for the session layer.
//!
//! [`SessionError`] mixes three families that callers treat very
//! differently:
//!
//! - **network-local**: `Cancelled`, `NoPlayerRemaining`. The session is
//!   over, nothing to retry.
//! - **parameters**: `CheckpointLoading`, `InvalidIds`, `NoPlayerAlive`.
//!   The lobby can renegotiate with its master and run again.
//! - **contract violations**: everything else. A scene asked for something
//!   that cannot exist; the content has a bug.
//!
//! [`SessionError::session_result`] folds them into the code reported to
//! lobby members.

use questline_protocol::{PlayerId, ProtocolError, SceneId, SessionResult};

/// Errors raised by a [`GameBuilder`](crate::GameBuilder) while loading or
/// saving checkpoints.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// No checkpoint with that name exists.
    #[error("checkpoint {0:?} not found")]
    NotFound(String),

    /// Saving would overwrite an existing checkpoint.
    #[error("checkpoint {0:?} already exists")]
    AlreadyExists(String),

    /// Reading or writing the backing store failed.
    #[error("checkpoint storage failed: {0}")]
    Io(#[from] std::io::Error),

    /// The stored document could not be (de)serialized.
    #[error("checkpoint format error: {0}")]
    Format(#[from] serde_json::Error),
}

/// Why a checkpoint's participant list was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidIdsReason {
    /// A connected participant is not part of the checkpoint.
    UnknownPlayer,
    /// A checkpoint participant is not connected.
    LessMembers,
}

/// Errors that can occur while a session runs.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The session was stopped while a request was waiting for replies.
    #[error("request cancelled")]
    Cancelled,

    /// Every participant disconnected.
    #[error("no player remaining")]
    NoPlayerRemaining,

    /// Every participant died according to the game rules.
    #[error("no player alive")]
    NoPlayerAlive,

    /// The requested checkpoint could not be loaded.
    #[error("checkpoint loading failed: {0}")]
    CheckpointLoading(#[source] CheckpointError),

    /// The checkpoint could not be saved.
    #[error("checkpoint saving failed: {0}")]
    CheckpointSaving(#[source] CheckpointError),

    /// Connected participants do not match the checkpoint.
    #[error("participants do not match checkpoint ({reason:?}), expected {expected:?}")]
    InvalidIds {
        reason: InvalidIdsReason,
        expected: Vec<PlayerId>,
    },

    /// Checkpoints cannot be taken during the introduction scene.
    #[error("cannot checkpoint during the introduction scene")]
    IntroductionCheckpoint,

    /// The leader was queried before any election happened.
    #[error("no leader elected yet")]
    NoLeader,

    /// No connected participant has this id.
    #[error("unknown player {0}")]
    UnknownPlayer(PlayerId),

    /// No stat with this name exists.
    #[error("unknown stat {0:?}")]
    UnknownStat(String),

    /// The player has no inventory with this name.
    #[error("unknown inventory {0:?}")]
    UnknownInventory(String),

    /// The scene provider has no scene with this id.
    #[error("unknown scene {0}")]
    UnknownScene(SceneId),

    /// `run()` was called on a session that already ran.
    #[error("session already started")]
    AlreadyStarted,

    /// An outgoing message could not be built.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A player update could not be serialized.
    #[error("player update serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SessionError {
    /// Maps this error onto the result code lobby members receive.
    pub fn session_result(&self) -> SessionResult {
        match self {
            Self::CheckpointLoading(_) => SessionResult::CheckpointLoadingError,
            Self::InvalidIds {
                reason: InvalidIdsReason::UnknownPlayer,
                ..
            } => SessionResult::UnknownPlayer,
            Self::InvalidIds {
                reason: InvalidIdsReason::LessMembers,
                ..
            } => SessionResult::LessMembers,
            Self::NoPlayerAlive => SessionResult::NoPlayerAlive,
            _ => SessionResult::Crashed,
        }
    }

    /// Ids the checkpoint expected, for roster mismatches.
    pub fn expected_ids(&self) -> &[PlayerId] {
        match self {
            Self::InvalidIds { expected, .. } => expected,
            _ => &[],
        }
    }
}
