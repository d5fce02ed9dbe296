//! # Questline
//!
//! Server backend for turn-based multiplayer interactive fiction.
//!
//! Players connect over TCP, register in a lobby and ready up. When the
//! countdown elapses the lowest id becomes master, picks a checkpoint (or a
//! new game) and the whole roster plays through the game's scenes. Game
//! content plugs in through [`GameBuilder`](questline_session::GameBuilder).
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use questline::prelude::*;
//!
//! // Implement GameBuilder for your game, then:
//! // let server = QuestlineServer::builder()
//! //     .bind("0.0.0.0:4000")
//! //     .build(Arc::new(MyGame::default()))
//! //     .await?;
//! // let status = server.run(shutdown_signal()).await;
//! ```

mod error;
mod server;

pub use error::QuestlineError;
pub use server::{ExitStatus, QuestlineServer, QuestlineServerBuilder, ServerConfig};

/// Installs the global `fmt` subscriber.
///
/// `RUST_LOG` wins when set; otherwise `default` (for example `"info"`) is
/// used as the filter directive. Calling it twice is harmless.
pub fn init_tracing(default: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Re-exports commonly used types for convenience.
///
/// ```rust
/// use questline::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{ExitStatus, QuestlineError, QuestlineServer, ServerConfig, init_tracing};

    pub use questline_lobby::{CloseMode, LobbyHandle, LobbyState};
    pub use questline_protocol::{ALL_PLAYERS, PlayerId, SceneId, Target, TextStyle};
    pub use questline_session::{
        CheckpointError, Comparison, Condition, DeathCondition, DiceFormula, EndCondition,
        GameBuilder, GameDescriptor, GameState, InventoryDescriptor, Next, ReplyPolicy, Scene,
        SceneProvider, Session, SessionError, StatDescriptor, StatLimits, Step, step,
    };
}
