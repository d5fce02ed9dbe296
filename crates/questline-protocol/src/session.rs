//! Messages sent by a running session.
//!
//! [`SessionEvent`] is the closed set of everything a client can receive
//! between `Start` and `Stop`. Encoding and decoding both `match` on every
//! variant, so adding one without teaching both directions fails to
//! compile.

use crate::{Message, MessageReader, PlayerId, ProtocolError, ReplyValidity, SceneId, Target};

wire_enum! {
    /// First byte after the length prefix of a session frame.
    pub enum SessionTag as "session tag" {
        Request = 0,
        Text = 1,
        PlayerUpdate = 2,
        GlobalStat = 3,
        Die = 4,
        SceneSwitch = 5,
        Reply = 6,
        Validation = 7,
        Battle = 8,
        Crash = 9,
        LeaderSwitch = 10,
        Start = 11,
        Stop = 12,
        FinishRequest = 13,
    }
}

wire_enum! {
    /// Which kind of answer a request expects.
    pub enum RequestTag as "request kind" {
        Range = 0,
        Options = 1,
        Confirm = 2,
        YesNo = 3,
        DiceRoll = 4,
    }
}

wire_enum! {
    /// How the client should render a piece of text.
    pub enum TextStyle as "text style" {
        Normal = 0,
        Important = 1,
        Title = 2,
        Note = 3,
    }
}

wire_enum! {
    /// Battle notice sub-kind.
    pub enum BattleTag as "battle notice" {
        Init = 0,
        Attack = 1,
        End = 2,
    }
}

/// The dice one participant rolled, shown alongside a dice-roll request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollOutcome {
    pub player: PlayerId,
    pub dice: Vec<u8>,
}

/// Request sub-payload, one per [`RequestTag`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    /// Any value in `min..=max`.
    Range { min: u8, max: u8 },
    /// An index into the listed options.
    Options(Vec<String>),
    /// Only `0` is accepted.
    Confirm,
    /// [`YES`](crate::YES) or [`NO`](crate::NO).
    YesNo,
    /// Server-side dice results to acknowledge.
    DiceRoll {
        dice: u8,
        bonus: i32,
        results: Vec<RollOutcome>,
    },
}

impl RequestKind {
    fn tag(&self) -> RequestTag {
        match self {
            Self::Range { .. } => RequestTag::Range,
            Self::Options(_) => RequestTag::Options,
            Self::Confirm => RequestTag::Confirm,
            Self::YesNo => RequestTag::YesNo,
            Self::DiceRoll { .. } => RequestTag::DiceRoll,
        }
    }
}

/// Visible bounds and value of a global stat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatValues {
    pub min: i32,
    pub max: i32,
    pub value: i32,
}

/// Battle notices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BattleEvent {
    /// Enemy roster as a JSON document.
    Init(String),
    Attack {
        player: PlayerId,
        enemy: String,
        damage: i32,
    },
    End,
}

/// Everything a session sends to its participants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Request {
        target: Target,
        prompt: String,
        kind: RequestKind,
    },
    Text {
        style: TextStyle,
        text: String,
    },
    /// JSON document listing what changed for that player.
    PlayerUpdate {
        player: PlayerId,
        diff: String,
    },
    /// `values` is `None` for a hidden stat.
    GlobalStat {
        name: String,
        main: bool,
        values: Option<StatValues>,
    },
    Die {
        player: PlayerId,
        reason: String,
    },
    SceneSwitch(SceneId),
    Reply {
        player: PlayerId,
        value: u8,
    },
    Validation(ReplyValidity),
    Battle(BattleEvent),
    Crash(PlayerId),
    LeaderSwitch(PlayerId),
    Start {
        game: String,
    },
    Stop,
    FinishRequest,
}

impl SessionEvent {
    /// The tag this event is framed with.
    pub fn tag(&self) -> SessionTag {
        match self {
            Self::Request { .. } => SessionTag::Request,
            Self::Text { .. } => SessionTag::Text,
            Self::PlayerUpdate { .. } => SessionTag::PlayerUpdate,
            Self::GlobalStat { .. } => SessionTag::GlobalStat,
            Self::Die { .. } => SessionTag::Die,
            Self::SceneSwitch(_) => SessionTag::SceneSwitch,
            Self::Reply { .. } => SessionTag::Reply,
            Self::Validation(_) => SessionTag::Validation,
            Self::Battle(_) => SessionTag::Battle,
            Self::Crash(_) => SessionTag::Crash,
            Self::LeaderSwitch(_) => SessionTag::LeaderSwitch,
            Self::Start { .. } => SessionTag::Start,
            Self::Stop => SessionTag::Stop,
            Self::FinishRequest => SessionTag::FinishRequest,
        }
    }

    /// Builds the finalized frame for this event.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let msg = Message::begin(self.tag());
        let msg = match self {
            Self::Request {
                target,
                prompt,
                kind,
            } => {
                let msg = msg
                    .add_byte(kind.tag())?
                    .add_byte(*target)?
                    .add_string(prompt)?;
                match kind {
                    RequestKind::Range { min, max } => {
                        msg.add_byte(*min)?.add_byte(*max)?
                    }
                    RequestKind::Options(options) => msg.add_options(options.as_slice())?,
                    RequestKind::Confirm | RequestKind::YesNo => msg,
                    RequestKind::DiceRoll {
                        dice,
                        bonus,
                        results,
                    } => {
                        let count = u8::try_from(results.len()).map_err(|_| {
                            ProtocolError::InvalidMessage(format!(
                                "{} roll results do not fit a count byte",
                                results.len()
                            ))
                        })?;
                        let mut msg = msg
                            .add_byte(*dice)?
                            .add_numeric(*bonus)?
                            .add_byte(count)?;
                        for outcome in results {
                            msg = msg.add_byte(outcome.player.0)?;
                            for die in &outcome.dice {
                                msg = msg.add_byte(*die)?;
                            }
                        }
                        msg
                    }
                }
            }
            Self::Text { style, text } => msg.add_byte(*style)?.add_string(text)?,
            Self::PlayerUpdate { player, diff } => {
                msg.add_byte(player.0)?.add_string(diff)?
            }
            Self::GlobalStat { name, main, values } => {
                let msg = msg
                    .add_string(name)?
                    .add_bool(values.is_none())?
                    .add_bool(*main)?;
                match values {
                    None => msg,
                    Some(v) => msg
                        .add_numeric(v.min)?
                        .add_numeric(v.max)?
                        .add_numeric(v.value)?,
                }
            }
            Self::Die { player, reason } => {
                msg.add_byte(player.0)?.add_string(reason)?
            }
            Self::SceneSwitch(scene) => msg.add_numeric(scene.0)?,
            Self::Reply { player, value } => {
                msg.add_byte(player.0)?.add_byte(*value)?
            }
            Self::Validation(validity) => msg.add_byte(*validity)?,
            Self::Battle(battle) => match battle {
                BattleEvent::Init(json) => {
                    msg.add_byte(BattleTag::Init)?.add_string(json)?
                }
                BattleEvent::Attack {
                    player,
                    enemy,
                    damage,
                } => msg
                    .add_byte(BattleTag::Attack)?
                    .add_byte(player.0)?
                    .add_string(enemy)?
                    .add_numeric(*damage)?,
                BattleEvent::End => msg.add_byte(BattleTag::End)?,
            },
            Self::Crash(player) | Self::LeaderSwitch(player) => {
                msg.add_byte(player.0)?
            }
            Self::Start { game } => msg.add_string(game)?,
            Self::Stop | Self::FinishRequest => msg,
        };
        Ok(msg.into_bytes())
    }

    /// Parses one complete frame.
    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        let (tag, mut r) = MessageReader::open(frame)?;
        let event = match SessionTag::try_from(tag)? {
            SessionTag::Request => {
                let kind_tag = RequestTag::try_from(r.read_byte()?)?;
                let target = Target::from(r.read_byte()?);
                let prompt = r.read_string()?;
                let kind = match kind_tag {
                    RequestTag::Range => RequestKind::Range {
                        min: r.read_byte()?,
                        max: r.read_byte()?,
                    },
                    RequestTag::Options => RequestKind::Options(r.read_options()?),
                    RequestTag::Confirm => RequestKind::Confirm,
                    RequestTag::YesNo => RequestKind::YesNo,
                    RequestTag::DiceRoll => {
                        let dice = r.read_byte()?;
                        let bonus = r.read_numeric()?;
                        let count = r.read_byte()?;
                        let mut results = Vec::with_capacity(count as usize);
                        for _ in 0..count {
                            let player = PlayerId(r.read_byte()?);
                            let rolled = (0..dice)
                                .map(|_| r.read_byte())
                                .collect::<Result<Vec<_>, _>>()?;
                            results.push(RollOutcome {
                                player,
                                dice: rolled,
                            });
                        }
                        RequestKind::DiceRoll {
                            dice,
                            bonus,
                            results,
                        }
                    }
                };
                Self::Request {
                    target,
                    prompt,
                    kind,
                }
            }
            SessionTag::Text => Self::Text {
                style: TextStyle::try_from(r.read_byte()?)?,
                text: r.read_string()?,
            },
            SessionTag::PlayerUpdate => Self::PlayerUpdate {
                player: PlayerId(r.read_byte()?),
                diff: r.read_string()?,
            },
            SessionTag::GlobalStat => {
                let name = r.read_string()?;
                let hidden = r.read_bool()?;
                let main = r.read_bool()?;
                let values = if hidden {
                    None
                } else {
                    Some(StatValues {
                        min: r.read_numeric()?,
                        max: r.read_numeric()?,
                        value: r.read_numeric()?,
                    })
                };
                Self::GlobalStat { name, main, values }
            }
            SessionTag::Die => Self::Die {
                player: PlayerId(r.read_byte()?),
                reason: r.read_string()?,
            },
            SessionTag::SceneSwitch => Self::SceneSwitch(SceneId(r.read_numeric()?)),
            SessionTag::Reply => Self::Reply {
                player: PlayerId(r.read_byte()?),
                value: r.read_byte()?,
            },
            SessionTag::Validation => {
                Self::Validation(ReplyValidity::try_from(r.read_byte()?)?)
            }
            SessionTag::Battle => Self::Battle(match BattleTag::try_from(r.read_byte()?)? {
                BattleTag::Init => BattleEvent::Init(r.read_string()?),
                BattleTag::Attack => BattleEvent::Attack {
                    player: PlayerId(r.read_byte()?),
                    enemy: r.read_string()?,
                    damage: r.read_numeric()?,
                },
                BattleTag::End => BattleEvent::End,
            }),
            SessionTag::Crash => Self::Crash(PlayerId(r.read_byte()?)),
            SessionTag::LeaderSwitch => Self::LeaderSwitch(PlayerId(r.read_byte()?)),
            SessionTag::Start => Self::Start {
                game: r.read_string()?,
            },
            SessionTag::Stop => Self::Stop,
            SessionTag::FinishRequest => Self::FinishRequest,
        };
        r.finish()?;
        Ok(event)
    }
}
