//! Messages exchanged while participants wait in the lobby.
//!
//! Outbound traffic is framed like session traffic (see [`LobbyEvent`]).
//! Inbound traffic is tiny and unframed: one read is one request.
//!
//! ```text
//! client                         server
//!   │ [id][name...] ───────────────▶│  registration
//!   │◀──────── Registration(result) │
//!   │ [0] ─────────────────────────▶│  toggle ready
//!   │ [1] ─────────────────────────▶│  leave
//! ```

use crate::{
    Message, MessageReader, PlayerId, ProtocolError, parse_text,
};

wire_enum! {
    /// First byte after the length prefix of a lobby frame.
    pub enum LobbyTag as "lobby tag" {
        MemberRegistered = 0,
        MemberReady = 1,
        MemberDisconnected = 2,
        MemberCrashed = 3,
        BeginCountdown = 4,
        SessionPreparation = 5,
        AskCheckpoint = 6,
        AskYesNo = 7,
        Start = 8,
        RunResult = 9,
        MasterDisconnected = 10,
        Open = 11,
        CancelCountdown = 12,
        SelectingCheckpoint = 13,
        CheckingPlayers = 14,
        RevisingParameters = 15,
        Registration = 16,
    }
}

wire_enum! {
    /// Answer to a registration attempt.
    pub enum RegistrationResult as "registration result" {
        Ok = 0,
        InvalidRequest = 1,
        UnavailableId = 2,
        UnavailableName = 3,
        UnavailableSession = 4,
    }
}

wire_enum! {
    /// Questions the master may be asked during preparation.
    pub enum YesNoQuestion as "yes/no question" {
        MissingEntrants = 0,
        RetryCheckpoint = 1,
        KickUnknownPlayers = 2,
    }
}

wire_enum! {
    /// How a session run ended, as reported to the lobby.
    pub enum SessionResult as "session result" {
        Ok = 0,
        Crashed = 1,
        CheckpointLoadingError = 2,
        LessMembers = 3,
        UnknownPlayer = 4,
        NoPlayerAlive = 5,
    }
}

impl SessionResult {
    /// Results the master can fix by changing the run parameters.
    pub fn is_parameters_error(self) -> bool {
        !matches!(self, Self::Ok | Self::Crashed)
    }

    /// Results that carry the list of ids the checkpoint expected.
    pub fn has_expected_ids(self) -> bool {
        matches!(self, Self::LessMembers | Self::UnknownPlayer)
    }
}

/// One row of the member listing sent to a new registrant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberInfo {
    pub id: PlayerId,
    pub name: String,
    pub ready: bool,
}

/// Everything the lobby sends to its members.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LobbyEvent {
    /// Reply to the registrant only. `members` lists everyone already
    /// registered and is empty unless `result` is `Ok`.
    Registration {
        result: RegistrationResult,
        members: Vec<MemberInfo>,
    },
    MemberRegistered {
        id: PlayerId,
        name: String,
    },
    /// Ready flag of that member flipped.
    MemberReady(PlayerId),
    MemberDisconnected(PlayerId),
    MemberCrashed(PlayerId),
    BeginCountdown {
        delay_ms: u64,
    },
    SessionPreparation {
        master: PlayerId,
    },
    AskCheckpoint,
    AskYesNo(YesNoQuestion),
    Start,
    /// `expected` is only sent for results that carry ids.
    RunResult {
        result: SessionResult,
        expected: Vec<PlayerId>,
    },
    MasterDisconnected,
    Open,
    CancelCountdown,
    SelectingCheckpoint,
    CheckingPlayers,
    RevisingParameters,
}

impl LobbyEvent {
    /// The tag this event is framed with.
    pub fn tag(&self) -> LobbyTag {
        match self {
            Self::Registration { .. } => LobbyTag::Registration,
            Self::MemberRegistered { .. } => LobbyTag::MemberRegistered,
            Self::MemberReady(_) => LobbyTag::MemberReady,
            Self::MemberDisconnected(_) => LobbyTag::MemberDisconnected,
            Self::MemberCrashed(_) => LobbyTag::MemberCrashed,
            Self::BeginCountdown { .. } => LobbyTag::BeginCountdown,
            Self::SessionPreparation { .. } => LobbyTag::SessionPreparation,
            Self::AskCheckpoint => LobbyTag::AskCheckpoint,
            Self::AskYesNo(_) => LobbyTag::AskYesNo,
            Self::Start => LobbyTag::Start,
            Self::RunResult { .. } => LobbyTag::RunResult,
            Self::MasterDisconnected => LobbyTag::MasterDisconnected,
            Self::Open => LobbyTag::Open,
            Self::CancelCountdown => LobbyTag::CancelCountdown,
            Self::SelectingCheckpoint => LobbyTag::SelectingCheckpoint,
            Self::CheckingPlayers => LobbyTag::CheckingPlayers,
            Self::RevisingParameters => LobbyTag::RevisingParameters,
        }
    }

    /// Builds the finalized frame for this event.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let msg = Message::begin(self.tag());
        let msg = match self {
            Self::Registration { result, members } => {
                let msg = msg.add_byte(*result)?;
                if *result == RegistrationResult::Ok {
                    let mut msg = msg.add_byte(count_byte(members.len())?)?;
                    for member in members {
                        msg = msg
                            .add_byte(member.id.0)?
                            .add_string(&member.name)?
                            .add_bool(member.ready)?;
                    }
                    msg
                } else {
                    msg
                }
            }
            Self::MemberRegistered { id, name } => {
                msg.add_byte(id.0)?.add_string(name)?
            }
            Self::MemberReady(id)
            | Self::MemberDisconnected(id)
            | Self::MemberCrashed(id) => msg.add_byte(id.0)?,
            Self::BeginCountdown { delay_ms } => msg.add_numeric(*delay_ms)?,
            Self::SessionPreparation { master } => msg.add_byte(master.0)?,
            Self::AskYesNo(question) => msg.add_byte(*question)?,
            Self::RunResult { result, expected } => {
                let msg = msg.add_byte(*result)?;
                if result.has_expected_ids() {
                    let mut msg = msg.add_byte(count_byte(expected.len())?)?;
                    for id in expected {
                        msg = msg.add_byte(id.0)?;
                    }
                    msg
                } else {
                    msg
                }
            }
            Self::AskCheckpoint
            | Self::Start
            | Self::MasterDisconnected
            | Self::Open
            | Self::CancelCountdown
            | Self::SelectingCheckpoint
            | Self::CheckingPlayers
            | Self::RevisingParameters => msg,
        };
        Ok(msg.into_bytes())
    }

    /// Parses one complete frame.
    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        let (tag, mut r) = MessageReader::open(frame)?;
        let event = match LobbyTag::try_from(tag)? {
            LobbyTag::Registration => {
                let result = RegistrationResult::try_from(r.read_byte()?)?;
                let mut members = Vec::new();
                if result == RegistrationResult::Ok {
                    let count = r.read_byte()?;
                    for _ in 0..count {
                        members.push(MemberInfo {
                            id: PlayerId(r.read_byte()?),
                            name: r.read_string()?,
                            ready: r.read_bool()?,
                        });
                    }
                }
                Self::Registration { result, members }
            }
            LobbyTag::MemberRegistered => Self::MemberRegistered {
                id: PlayerId(r.read_byte()?),
                name: r.read_string()?,
            },
            LobbyTag::MemberReady => Self::MemberReady(PlayerId(r.read_byte()?)),
            LobbyTag::MemberDisconnected => {
                Self::MemberDisconnected(PlayerId(r.read_byte()?))
            }
            LobbyTag::MemberCrashed => Self::MemberCrashed(PlayerId(r.read_byte()?)),
            LobbyTag::BeginCountdown => Self::BeginCountdown {
                delay_ms: r.read_numeric()?,
            },
            LobbyTag::SessionPreparation => Self::SessionPreparation {
                master: PlayerId(r.read_byte()?),
            },
            LobbyTag::AskCheckpoint => Self::AskCheckpoint,
            LobbyTag::AskYesNo => {
                Self::AskYesNo(YesNoQuestion::try_from(r.read_byte()?)?)
            }
            LobbyTag::Start => Self::Start,
            LobbyTag::RunResult => {
                let result = SessionResult::try_from(r.read_byte()?)?;
                let mut expected = Vec::new();
                if result.has_expected_ids() {
                    let count = r.read_byte()?;
                    for _ in 0..count {
                        expected.push(PlayerId(r.read_byte()?));
                    }
                }
                Self::RunResult { result, expected }
            }
            LobbyTag::MasterDisconnected => Self::MasterDisconnected,
            LobbyTag::Open => Self::Open,
            LobbyTag::CancelCountdown => Self::CancelCountdown,
            LobbyTag::SelectingCheckpoint => Self::SelectingCheckpoint,
            LobbyTag::CheckingPlayers => Self::CheckingPlayers,
            LobbyTag::RevisingParameters => Self::RevisingParameters,
        };
        r.finish()?;
        Ok(event)
    }
}

fn count_byte(len: usize) -> Result<u8, ProtocolError> {
    u8::try_from(len).map_err(|_| {
        ProtocolError::InvalidMessage(format!("{len} entries do not fit a count byte"))
    })
}

// ---------------------------------------------------------------------------
// Inbound requests
// ---------------------------------------------------------------------------

/// A registration attempt: `[id][name bytes]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub id: PlayerId,
    pub name: String,
}

impl Registration {
    /// Parses the first message a new connection sends.
    ///
    /// An empty name still parses; whether it is acceptable is the
    /// lobby's call.
    pub fn parse(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (&id, name) = bytes.split_first().ok_or_else(|| {
            ProtocolError::InvalidMessage("empty registration".into())
        })?;
        Ok(Self {
            id: PlayerId(id),
            name: parse_text(name)?,
        })
    }
}

wire_enum! {
    /// What a registered member can ask while the lobby is open.
    pub enum MemberRequest as "member request" {
        Ready = 0,
        Disconnect = 1,
    }
}

impl MemberRequest {
    /// Parses a one-byte member request.
    pub fn parse(bytes: &[u8]) -> Result<Self, ProtocolError> {
        match bytes {
            [byte] => Self::try_from(*byte),
            _ => Err(ProtocolError::InvalidMessage(format!(
                "member request must be one byte, got {}",
                bytes.len()
            ))),
        }
    }
}
