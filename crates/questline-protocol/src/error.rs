//! Error types for the protocol layer.
//!
//! Everything that can go wrong while building or parsing a frame lands
//! here. Callers upstream treat any of these coming from a client as a
//! misbehaving peer; coming from the server side they are bugs.

/// Errors that can occur in the protocol layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// Appending would push the message past the maximum frame size.
    ///
    /// The builder that produced this is consumed; start a new message.
    #[error("message would take {attempted} bytes, limit is {max}")]
    BufferOverflow { max: usize, attempted: usize },

    /// An options list can only announce 255 entries in its count byte.
    #[error("options list has {0} entries, at most 255 allowed")]
    TooManyOptions(usize),

    /// The input ended before the field being read was complete.
    #[error("truncated message: needed {needed} more bytes, {remaining} left")]
    Truncated { needed: usize, remaining: usize },

    /// The length prefix disagrees with the number of bytes that follow it.
    #[error("length prefix says {declared} bytes but {actual} follow")]
    LengthMismatch { declared: usize, actual: usize },

    /// A string field is not valid UTF-8.
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,

    /// A tag or code byte has no matching variant.
    #[error("unknown {kind} value {value}")]
    UnknownTag { kind: &'static str, value: u8 },

    /// The message is well-formed bytes but breaks a protocol rule.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}
