//! Game sessions for Questline.
//!
//! This crate runs one game over a fixed set of participant connections:
//!
//! 1. **Reply correlation**: send a request, collect validated single-byte
//!    replies under a quorum policy ([`ReplyPolicy`])
//! 2. **Scene execution**: new game or checkpoint restore, then scenes
//!    until none is left ([`Session`])
//! 3. **Game ledger**: stats, inventories and the snapshots checkpoints
//!    are made of ([`GameState`])
//!
//! # How it fits in the stack
//!
//! ```text
//! Lobby Layer (above)  ← hands connections in, gets them back after the run
//!     ↕
//! Session Layer (this crate)  ← scenes, requests, leader, checkpoints
//!     ↕
//! Protocol + Transport (below)  ← SessionEvent frames over Connections
//! ```
//!
//! Game content plugs in through [`GameBuilder`] and [`SceneProvider`].

mod builder;
mod error;
mod ledger;
mod request;
mod session;

pub use builder::{
    FIRST_SCENE, GameBuilder, INTRO_SCENE, Next, Scene, SceneProvider, Step, step,
};
pub use error::{CheckpointError, InvalidIdsReason, SessionError};
pub use ledger::{
    Comparison, Condition, DeathCondition, DiceFormula, EndCondition, GameDescriptor, GameState,
    Inventory, InventoryDescriptor, Player, PlayerDiff, PlayerState, Roll, Stat, StatDescriptor,
    StatLimits, StatsManager,
};
pub use request::{Replies, ReplyPolicy, Validator};
pub use session::{Lifecycle, Participant, RunOutcome, RunParameters, Session, StopHandle};
