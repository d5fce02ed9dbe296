//! Lobby configuration and state machine.

use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// LobbyConfig
// ---------------------------------------------------------------------------

/// Configuration for a lobby instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LobbyConfig {
    /// Delay between everyone being ready and session preparation.
    pub countdown: Duration,

    /// Seed for the random source handed to each session. `None` seeds
    /// from the operating system.
    pub rng_seed: Option<u64>,

    /// Capacity of the actor's command queue.
    pub command_buffer: usize,
}

impl Default for LobbyConfig {
    fn default() -> Self {
        Self {
            countdown: Duration::from_secs(5),
            rng_seed: None,
            command_buffer: 64,
        }
    }
}

// ---------------------------------------------------------------------------
// LobbyState
// ---------------------------------------------------------------------------

/// The lifecycle state of a lobby.
///
/// ```text
///            all ready               countdown elapsed
///   Open ─────────────────▶ Starting ─────────────────▶ Preparing ──▶ Running
///    ▲  ◀─────────────────                                   │           │
///    │    readiness broken                                   │           │
///    └───────────────────────────────────────────────────────┴───────────┘
///                      (any state) ──close──▶ Closed
/// ```
///
/// - **Open**: accepting registrations and ready toggles.
/// - **Starting**: every member is ready; a cancellable countdown runs.
/// - **Preparing**: registrations and member requests are paused while
///   the master picks a checkpoint and answers follow-up questions.
/// - **Running**: a session owns the member connections.
/// - **Closed**: terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LobbyState {
    Open,
    Starting,
    Preparing,
    Running,
    Closed,
}

impl LobbyState {
    /// Returns `true` if new members may register.
    pub fn is_registering(&self) -> bool {
        matches!(self, Self::Open)
    }

    /// Returns `true` while a session is being prepared or run.
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Preparing | Self::Running)
    }
}

impl std::fmt::Display for LobbyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "Open"),
            Self::Starting => write!(f, "Starting"),
            Self::Preparing => write!(f, "Preparing"),
            Self::Running => write!(f, "Running"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

/// How a lobby closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseMode {
    /// Every member connection is shut down in order.
    Graceful,
    /// Member connections are dropped as they are.
    Crash,
}
