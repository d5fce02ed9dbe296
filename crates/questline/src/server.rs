//! `QuestlineServer` builder and executor.
//!
//! This is the entry point for running a Questline server. It binds the
//! transport, spawns the lobby actor and supervises it until either a
//! shutdown signal arrives or the lobby fails.

use std::future::Future;
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use questline_lobby::{CloseMode, Lobby, LobbyConfig, LobbyError, LobbyHandle};
use questline_session::GameBuilder;
use questline_transport::{TcpTransport, TransportError};
use serde::{Deserialize, Serialize};
use tokio::task::JoinError;

use crate::QuestlineError;

// ---------------------------------------------------------------------------
// ServerConfig
// ---------------------------------------------------------------------------

/// Settings for a Questline server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the TCP listener binds to.
    pub bind_addr: String,

    /// Lobby countdown between everyone being ready and preparation.
    pub countdown: Duration,

    /// Seed for dice rolls and vote tie-breaks. `None` seeds from the OS.
    pub rng_seed: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:4000".to_string(),
            countdown: Duration::from_secs(5),
            rng_seed: None,
        }
    }
}

impl ServerConfig {
    fn lobby_config(&self) -> LobbyConfig {
        LobbyConfig {
            countdown: self.countdown,
            rng_seed: self.rng_seed,
            ..LobbyConfig::default()
        }
    }
}

// ---------------------------------------------------------------------------
// ExitStatus
// ---------------------------------------------------------------------------

/// How the executor ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Closed on request; every member was disconnected in order.
    Success,
    /// The lobby failed and was torn down.
    Crashed,
}

impl ExitStatus {
    /// Process exit code: 0 on success, 2 after a crash.
    pub fn code(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::Crashed => 2,
        }
    }
}

impl From<ExitStatus> for ExitCode {
    fn from(status: ExitStatus) -> Self {
        ExitCode::from(status.code())
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for configuring and starting a Questline server.
///
/// # Example
///
/// ```rust,ignore
/// use questline::prelude::*;
///
/// let server = QuestlineServer::builder()
///     .bind("0.0.0.0:4000")
///     .countdown(Duration::from_secs(3))
///     .build(Arc::new(MyGame::default()))
///     .await?;
/// let status = server
///     .run(async {
///         let _ = tokio::signal::ctrl_c().await;
///     })
///     .await;
/// ```
pub struct QuestlineServerBuilder {
    config: ServerConfig,
}

impl QuestlineServerBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
        }
    }

    /// Sets the address to bind the server to.
    pub fn bind(mut self, addr: &str) -> Self {
        self.config.bind_addr = addr.to_string();
        self
    }

    /// Sets the lobby countdown.
    pub fn countdown(mut self, countdown: Duration) -> Self {
        self.config.countdown = countdown;
        self
    }

    /// Seeds the server's random source.
    pub fn seed(mut self, seed: u64) -> Self {
        self.config.rng_seed = Some(seed);
        self
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Binds the listener and sets up the lobby for `builder`'s game.
    pub async fn build(
        self,
        builder: Arc<dyn GameBuilder>,
    ) -> Result<QuestlineServer, QuestlineError> {
        let transport = TcpTransport::bind(&self.config.bind_addr).await?;
        let local_addr = transport.local_addr().map_err(|source| TransportError::BindFailed {
            addr: self.config.bind_addr.clone(),
            source,
        })?;
        let (lobby, handle) = Lobby::new(transport, builder, self.config.lobby_config());
        Ok(QuestlineServer {
            lobby,
            handle,
            local_addr,
        })
    }
}

impl Default for QuestlineServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// A bound Questline server, ready to [`run`](Self::run).
pub struct QuestlineServer {
    lobby: Lobby<TcpTransport>,
    handle: LobbyHandle,
    local_addr: SocketAddr,
}

impl QuestlineServer {
    /// Creates a new builder.
    pub fn builder() -> QuestlineServerBuilder {
        QuestlineServerBuilder::new()
    }

    /// Returns the address the listener is actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns a handle to the lobby, for observing its state.
    pub fn handle(&self) -> LobbyHandle {
        self.handle.clone()
    }

    /// Runs the lobby until `shutdown` resolves or the lobby fails.
    ///
    /// A shutdown closes the lobby gracefully and waits for it to finish.
    /// A lobby error or panic is fatal and reported as
    /// [`ExitStatus::Crashed`].
    pub async fn run<F>(self, shutdown: F) -> ExitStatus
    where
        F: Future<Output = ()>,
    {
        let Self { lobby, handle, local_addr } = self;
        tracing::info!(%local_addr, "Questline server running");
        let mut task = tokio::spawn(lobby.run());

        tokio::select! {
            joined = &mut task => return supervise(&handle, joined),
            () = shutdown => {}
        }

        tracing::info!("shutdown requested, closing lobby");
        handle.close(CloseMode::Graceful);
        let status = supervise(&handle, task.await);
        tracing::info!(?status, "Questline server stopped");
        status
    }
}

/// Maps how the lobby task ended to an exit status.
fn supervise(
    handle: &LobbyHandle,
    joined: Result<Result<(), LobbyError>, JoinError>,
) -> ExitStatus {
    match joined {
        Ok(Ok(())) => ExitStatus::Success,
        Ok(Err(e)) => {
            tracing::error!(error = %e, "lobby failed");
            handle.close(CloseMode::Crash);
            ExitStatus::Crashed
        }
        Err(e) => {
            tracing::error!(error = %e, "lobby task panicked");
            handle.close(CloseMode::Crash);
            ExitStatus::Crashed
        }
    }
}

#[cfg(test)]
mod tests {
    use questline_protocol::SceneId;
    use questline_session::{
        CheckpointError, GameDescriptor, GameState, Scene, SceneProvider, SessionError,
    };

    use super::*;

    struct Blank(GameDescriptor);

    impl SceneProvider for Blank {
        fn scene(&self, id: SceneId) -> Result<Scene, SessionError> {
            Err(SessionError::UnknownScene(id))
        }
    }

    impl GameBuilder for Blank {
        fn game(&self) -> &GameDescriptor {
            &self.0
        }

        fn load(&self, name: &str) -> Result<GameState, CheckpointError> {
            Err(CheckpointError::NotFound(name.to_string()))
        }

        fn save(&self, name: &str, _state: &GameState) -> Result<String, CheckpointError> {
            Ok(name.to_string())
        }
    }

    async fn idle_handle() -> LobbyHandle {
        let transport = TcpTransport::bind("127.0.0.1:0").await.unwrap();
        let game: Arc<dyn GameBuilder> = Arc::new(Blank(GameDescriptor::default()));
        let (_lobby, handle) = Lobby::new(transport, game, LobbyConfig::default());
        handle
    }

    #[tokio::test]
    async fn test_supervise_lobby_error_is_crashed() {
        let handle = idle_handle().await;
        let status = supervise(&handle, Ok(Err(LobbyError::Unavailable)));
        assert_eq!(status, ExitStatus::Crashed);
    }

    #[tokio::test]
    async fn test_supervise_lobby_task_panic_is_crashed() {
        let handle = idle_handle().await;
        let task: tokio::task::JoinHandle<Result<(), LobbyError>> =
            tokio::spawn(async { panic!("lobby exploded") });
        assert_eq!(supervise(&handle, task.await), ExitStatus::Crashed);
        assert_eq!(supervise(&handle, Ok(Ok(()))), ExitStatus::Success);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(ExitStatus::Success.code(), 0);
        assert_eq!(ExitStatus::Crashed.code(), 2);
    }

    #[test]
    fn test_builder_settings_reach_config() {
        let builder = QuestlineServer::builder()
            .bind("0.0.0.0:9000")
            .countdown(Duration::from_millis(250))
            .seed(7);
        assert_eq!(builder.config.bind_addr, "0.0.0.0:9000");
        assert_eq!(builder.config.countdown, Duration::from_millis(250));
        assert_eq!(builder.config.rng_seed, Some(7));

        let lobby = builder.config.lobby_config();
        assert_eq!(lobby.countdown, Duration::from_millis(250));
        assert_eq!(lobby.rng_seed, Some(7));
    }

    #[test]
    fn test_config_from_json() {
        let config: ServerConfig = serde_json::from_str(
            r#"{"bind_addr":"0.0.0.0:1","countdown":{"secs":2,"nanos":0},"rng_seed":null}"#,
        )
        .unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:1");
        assert_eq!(config.countdown, Duration::from_secs(2));
        assert!(config.rng_seed.is_none());
    }
}
