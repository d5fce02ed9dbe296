//! Lobby layer for Questline.
//!
//! The lobby gathers players before a game:
//!
//! - new connections register with an id and a name
//! - members toggle readiness; when everyone is ready a countdown starts
//! - when it elapses the lowest id becomes master and picks a checkpoint
//! - the whole roster is handed to a [`Session`](questline_session::Session)
//!   and taken back when it ends
//!
//! The lobby is an actor: [`Lobby::run`] owns all state and
//! [`LobbyHandle`] talks to it from the outside.
//!
//! ```text
//! Executor (above)  ← spawns the lobby, closes it on signal or failure
//!     ↕
//! Lobby Layer (this crate)  ← registration, readiness, preparation
//!     ↕
//! Session Layer (below)  ← runs the game on the members' connections
//! ```

mod config;
mod error;
mod lobby;

pub use config::{CloseMode, LobbyConfig, LobbyState};
pub use error::LobbyError;
pub use lobby::{Lobby, LobbyHandle};
