//! Identity types and shared codes for Questline's wire format.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ProtocolError;

// ---------------------------------------------------------------------------
// Identity types
// ---------------------------------------------------------------------------

/// A participant id, chosen by the client at lobby registration.
///
/// Fits in one byte on the wire. `255` is reserved for [`Target::All`], so
/// registration refuses it. Ordering matters: "lowest id" is how both the
/// lobby master and a replacement leader get picked.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct PlayerId(pub u8);

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P-{}", self.0)
    }
}

/// Identifies one scene of the story graph.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct SceneId(pub u16);

impl fmt::Display for SceneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S-{}", self.0)
    }
}

/// Byte value meaning "every participant" in a request target.
pub const ALL_PLAYERS: u8 = 255;

/// Answer byte for "yes" to any yes/no question.
pub const YES: u8 = 0;
/// Answer byte for "no" to any yes/no question.
pub const NO: u8 = 1;

// ---------------------------------------------------------------------------
// Target
// ---------------------------------------------------------------------------

/// Who a request is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// One participant.
    Player(PlayerId),
    /// Everyone currently in the session.
    All,
}

impl From<Target> for u8 {
    fn from(target: Target) -> u8 {
        match target {
            Target::Player(id) => id.0,
            Target::All => ALL_PLAYERS,
        }
    }
}

impl From<u8> for Target {
    fn from(value: u8) -> Self {
        if value == ALL_PLAYERS {
            Target::All
        } else {
            Target::Player(PlayerId(value))
        }
    }
}

impl From<PlayerId> for Target {
    fn from(id: PlayerId) -> Self {
        Target::Player(id)
    }
}

// ---------------------------------------------------------------------------
// Reply validation
// ---------------------------------------------------------------------------

wire_enum! {
    /// Outcome of checking one reply byte.
    ///
    /// `Ok` and `TooLate` are both "valid": the client did nothing wrong.
    /// Everything above `TooLate` asks the client to answer again.
    pub enum ReplyValidity as "reply validity" {
        Ok = 0,
        TooLate = 1,
        OutOfRange = 2,
        InvalidLength = 3,
        NotConfirm = 4,
    }
}

impl ReplyValidity {
    /// Returns `true` when the client has to send another reply.
    pub fn is_invalid(self) -> bool {
        u8::from(self) > u8::from(Self::TooLate)
    }
}

impl fmt::Display for ReplyValidity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Ok => "ok",
            Self::TooLate => "too late",
            Self::OutOfRange => "out of range",
            Self::InvalidLength => "invalid length",
            Self::NotConfirm => "not a confirmation",
        };
        f.write_str(text)
    }
}

/// Parses a single-byte client reply.
///
/// Anything other than exactly one byte is [`ReplyValidity::InvalidLength`].
pub fn parse_reply(bytes: &[u8]) -> Result<u8, ReplyValidity> {
    match bytes {
        [value] => Ok(*value),
        _ => Err(ReplyValidity::InvalidLength),
    }
}

/// Parses a yes/no answer byte. `true` means yes.
pub fn parse_yes_no(bytes: &[u8]) -> Result<bool, ProtocolError> {
    match bytes {
        [YES] => Ok(true),
        [NO] => Ok(false),
        [other] => Err(ProtocolError::InvalidMessage(format!(
            "yes/no answer must be {YES} or {NO}, got {other}"
        ))),
        _ => Err(ProtocolError::InvalidMessage(format!(
            "yes/no answer must be one byte, got {}",
            bytes.len()
        ))),
    }
}

/// Decodes a raw UTF-8 text sent by a client, dropping trailing NULs.
///
/// Some clients send C-style strings; the terminator carries no meaning.
pub fn parse_text(bytes: &[u8]) -> Result<String, ProtocolError> {
    let end = bytes
        .iter()
        .rposition(|b| *b != 0)
        .map_or(0, |last| last + 1);
    std::str::from_utf8(&bytes[..end])
        .map(str::to_owned)
        .map_err(|_| ProtocolError::InvalidUtf8)
}
