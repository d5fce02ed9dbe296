//! Collaborator traits: where scenes and checkpoints come from.
//!
//! The session core doesn't interpret game content. It asks a
//! [`SceneProvider`] for the ordered steps of a scene and runs them, and
//! asks a [`GameBuilder`] for the game description and for checkpoint
//! storage.
//!
//! A step is an async closure over the running [`Session`]:
//!
//! ```rust,ignore
//! use questline_session::{step, Scene};
//!
//! let scene: Scene = vec![
//!     step(|s| Box::pin(async move {
//!         s.print(TextStyle::Title, "The cave").await?;
//!         Ok(None)
//!     })),
//!     step(|s| Box::pin(async move {
//!         let choice = s.ask_options(Target::All, "Go?", &["left", "right"], ReplyPolicy::all()).await?;
//!         Ok(Some(SceneId(2)))
//!     })),
//! ];
//! ```

use futures_util::future::BoxFuture;
use questline_protocol::SceneId;

use crate::{CheckpointError, GameDescriptor, GameState, Session, SessionError};

/// Id of the introduction scene, played once before a new game's stats
/// exist. Checkpoints are refused while it runs.
pub const INTRO_SCENE: SceneId = SceneId(0);

/// First scene of the main loop for a new game.
pub const FIRST_SCENE: SceneId = SceneId(1);

/// What a step produces: a scene to jump to, or `None` to fall through to
/// the next step.
pub type Next = Option<SceneId>;

/// One executable step of a scene.
pub type Step = Box<
    dyn for<'a> Fn(&'a mut Session) -> BoxFuture<'a, Result<Next, SessionError>>
        + Send
        + Sync,
>;

/// An ordered list of steps.
pub type Scene = Vec<Step>;

/// Boxes a closure as a [`Step`].
///
/// Exists so closure signatures get inferred against the higher-ranked
/// bound; writing `Box::new(|s| ...)` directly usually fails to.
pub fn step<F>(f: F) -> Step
where
    F: for<'a> Fn(&'a mut Session) -> BoxFuture<'a, Result<Next, SessionError>>
        + Send
        + Sync
        + 'static,
{
    Box::new(f)
}

/// Supplies the steps of each scene.
pub trait SceneProvider: Send + Sync + 'static {
    /// Builds the steps of scene `id`.
    ///
    /// # Errors
    /// [`SessionError::UnknownScene`] when no such scene exists.
    fn scene(&self, id: SceneId) -> Result<Scene, SessionError>;
}

/// Game description plus checkpoint storage.
pub trait GameBuilder: SceneProvider {
    /// The game being played.
    fn game(&self) -> &GameDescriptor;

    /// Loads a checkpoint by name.
    fn load(&self, name: &str) -> Result<GameState, CheckpointError>;

    /// Saves a checkpoint and returns the name it was stored under, which
    /// may differ from `name` (suffixed to stay unique, for example).
    fn save(&self, name: &str, state: &GameState) -> Result<String, CheckpointError>;
}
