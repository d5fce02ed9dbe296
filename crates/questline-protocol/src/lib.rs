//! Wire protocol for Questline.
//!
//! This crate defines the bytes clients and server exchange:
//!
//! - **Codec** ([`Message`], [`MessageReader`]): length-prefixed frames and
//!   their field encodings.
//! - **Session traffic** ([`SessionEvent`]): narration, requests, stat and
//!   player updates sent while a game runs.
//! - **Lobby traffic** ([`LobbyEvent`], [`Registration`],
//!   [`MemberRequest`]): admission, readiness and preparation.
//! - **Errors** ([`ProtocolError`]).
//!
//! The protocol layer doesn't know about sockets. It turns values into
//! frames and frames back into values.

#[macro_use]
mod macros;

mod codec;
mod error;
mod lobby;
mod session;
mod types;

pub use codec::{LENGTH_PREFIX_LEN, MAX_MESSAGE_LEN, Message, MessageReader, WireNumeric};
pub use error::ProtocolError;
pub use lobby::{
    LobbyEvent, LobbyTag, MemberInfo, MemberRequest, Registration,
    RegistrationResult, SessionResult, YesNoQuestion,
};
pub use session::{
    BattleEvent, BattleTag, RequestKind, RequestTag, RollOutcome, SessionEvent,
    SessionTag, StatValues, TextStyle,
};
pub use types::{
    ALL_PLAYERS, NO, PlayerId, ReplyValidity, SceneId, Target, YES, parse_reply,
    parse_text, parse_yes_no,
};
