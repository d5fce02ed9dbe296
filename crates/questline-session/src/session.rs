//! Session scene-execution state machine.
//!
//! ```text
//!   NotStarted ──run()──▶ Running ──(no next scene | stop | error)──▶ Stopped
//!                           │
//!                           ├─ new game:  intro scene, roll stats, elect leader
//!                           └─ restore:   load checkpoint, check roster
//! ```
//!
//! The session is owned by whichever task awaits [`Session::run`]. Scene
//! steps borrow it mutably, so requests are strictly sequential. The only
//! thing shared with other tasks is the stop flag behind [`StopHandle`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use questline_protocol::{
    BattleEvent, PlayerId, ProtocolError, ReplyValidity, RequestKind, RollOutcome, SceneId,
    SessionEvent, Target, TextStyle,
};
use questline_transport::Connection;
use rand::Rng;
use rand::rngs::StdRng;
use tokio::sync::watch;
use tracing::Instrument;

use crate::builder::{FIRST_SCENE, INTRO_SCENE, Next};
use crate::request::{self, Replies, ReplyPolicy, Validator};
use crate::{
    Condition, DiceFormula, GameBuilder, GameDescriptor, GameState, InvalidIdsReason, Player,
    PlayerDiff, PlayerState, Roll, SessionError, Stat, StatsManager,
};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Where a session is in its single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    NotStarted,
    Running,
    Stopped,
}

/// Cloneable handle that stops a session from outside its task.
///
/// Stopping is sticky: any request waiting for replies resolves as
/// cancelled, the current scene ends, and the session shuts down.
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }
}

/// A connected member handed to the session for one run.
#[derive(Debug)]
pub struct Participant {
    pub id: PlayerId,
    pub name: String,
    pub connection: Arc<Connection>,
}

/// How a run starts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunParameters {
    /// Checkpoint to restore. `None` or empty starts a new game.
    pub checkpoint: Option<String>,
    /// Restore even if some checkpoint participants are not connected.
    pub allow_missing: bool,
}

impl RunParameters {
    pub fn new_game() -> Self {
        Self::default()
    }

    pub fn restore(checkpoint: impl Into<String>) -> Self {
        Self {
            checkpoint: Some(checkpoint.into()),
            allow_missing: false,
        }
    }
}

/// What a finished run hands back.
#[derive(Debug)]
pub struct RunOutcome {
    pub result: Result<(), SessionError>,
    /// Participants still connected after the stop notice.
    pub participants: Vec<Participant>,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One run of a game over a fixed set of connections.
pub struct Session {
    builder: Arc<dyn GameBuilder>,
    lifecycle: Lifecycle,
    stop: StopHandle,
    stop_rx: watch::Receiver<bool>,
    participants: BTreeMap<PlayerId, Participant>,
    players: BTreeMap<PlayerId, Player>,
    globals: StatsManager,
    leader: Option<PlayerId>,
    current_scene: Option<SceneId>,
    rng: StdRng,
    /// Last state announced per player, for update diffs.
    announced: HashMap<PlayerId, PlayerState>,
}

impl Session {
    pub fn new(builder: Arc<dyn GameBuilder>, rng: StdRng) -> Self {
        let (tx, stop_rx) = watch::channel(false);
        Self {
            builder,
            lifecycle: Lifecycle::NotStarted,
            stop: StopHandle { tx: Arc::new(tx) },
            stop_rx,
            participants: BTreeMap::new(),
            players: BTreeMap::new(),
            globals: StatsManager::new(),
            leader: None,
            current_scene: None,
            rng,
            announced: HashMap::new(),
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    /// Running and not asked to stop.
    pub fn is_running(&self) -> bool {
        self.lifecycle == Lifecycle::Running && !*self.stop_rx.borrow()
    }

    /// Runs the whole game and always ends with the stop notice.
    ///
    /// Connected participants are handed back through the outcome, even
    /// when the run failed.
    pub async fn run(
        &mut self,
        participants: Vec<Participant>,
        params: RunParameters,
    ) -> RunOutcome {
        if self.lifecycle != Lifecycle::NotStarted {
            return RunOutcome {
                result: Err(SessionError::AlreadyStarted),
                participants,
            };
        }
        let span = tracing::info_span!("session", game = %self.builder.game().name);
        self.run_inner(participants, params).instrument(span).await
    }

    async fn run_inner(
        &mut self,
        participants: Vec<Participant>,
        params: RunParameters,
    ) -> RunOutcome {
        self.participants = participants.into_iter().map(|p| (p.id, p)).collect();
        self.lifecycle = Lifecycle::Running;
        tracing::info!(
            participants = self.participants.len(),
            checkpoint = ?params.checkpoint,
            "session started"
        );

        let result = match self.play(params).await {
            Err(SessionError::Cancelled) => Ok(()),
            other => other,
        };
        match &result {
            Ok(()) => tracing::info!("session finished"),
            Err(e) => tracing::warn!(error = %e, "session ended with error"),
        }

        let participants = self.shutdown().await;
        self.lifecycle = Lifecycle::Stopped;
        RunOutcome {
            result,
            participants,
        }
    }

    async fn play(&mut self, params: RunParameters) -> Result<(), SessionError> {
        let game = self.builder.game().name.clone();
        self.broadcast(SessionEvent::Start { game }).await?;
        if !self.is_running() {
            return Ok(());
        }

        let first = match params.checkpoint.as_deref().filter(|name| !name.is_empty()) {
            None => {
                self.new_game().await?;
                FIRST_SCENE
            }
            Some(name) => self.restore(name, params.allow_missing).await?,
        };
        if !self.is_running() {
            return Ok(());
        }

        let ids: Vec<PlayerId> = self.players.keys().copied().collect();
        for id in ids {
            if self.players.contains_key(&id) {
                self.send_player_update(id).await?;
            }
        }

        let mut next = Some(first);
        while let Some(scene) = next {
            if !self.is_running() {
                break;
            }
            next = self.play_scene(scene).await?;
        }
        Ok(())
    }

    async fn new_game(&mut self) -> Result<(), SessionError> {
        self.play_scene(INTRO_SCENE).await?;
        if !self.is_running() {
            return Ok(());
        }

        let builder = Arc::clone(&self.builder);
        let game = builder.game();

        if game.global_stats.iter().any(|(_, descriptor)| !descriptor.hidden) {
            self.print(TextStyle::Note, "Global stats:").await?;
        }
        for (name, descriptor) in &game.global_stats {
            let stat = descriptor.instantiate(&mut self.rng);
            self.globals.insert(name.clone(), stat);
            self.broadcast(stat.to_event(name)).await?;
            if !descriptor.hidden {
                let line = format!("{name}: {}", roll_text(descriptor.initial, stat.value));
                self.print(TextStyle::Note, &line).await?;
            }
        }

        let roster: Vec<(PlayerId, String)> = self
            .participants
            .values()
            .map(|p| (p.id, p.name.clone()))
            .collect();
        for (id, name) in roster {
            let player = Player::new(id, &name, game, &mut self.rng);
            let lines = setup_lines(&player, game);
            self.players.insert(id, player);
            for line in lines {
                self.print(TextStyle::Note, &line).await?;
            }
        }

        let voted = if game.vote_leader {
            self.vote_for_leader().await?
        } else {
            None
        };
        let leader = voted
            .or_else(|| self.lowest_id())
            .ok_or(SessionError::NoPlayerRemaining)?;
        self.switch_leader(leader).await
    }

    /// Lets everyone vote for a leader. `None` when there is nobody to
    /// choose between or the winner left during the vote.
    async fn vote_for_leader(&mut self) -> Result<Option<PlayerId>, SessionError> {
        if self.participants.len() < 2 {
            return Ok(None);
        }
        let (ids, names): (Vec<PlayerId>, Vec<String>) = self
            .participants
            .values()
            .map(|p| (p.id, p.name.clone()))
            .unzip();
        let choice = self.vote("Who will lead the party?", &names).await?;
        Ok(ids
            .get(choice)
            .copied()
            .filter(|id| self.participants.contains_key(id)))
    }

    async fn restore(&mut self, name: &str, allow_missing: bool) -> Result<SceneId, SessionError> {
        let state = self
            .builder
            .load(name)
            .map_err(SessionError::CheckpointLoading)?;
        let expected: Vec<PlayerId> = state.players.keys().copied().collect();

        if self
            .participants
            .keys()
            .any(|id| !state.players.contains_key(id))
        {
            return Err(SessionError::InvalidIds {
                reason: InvalidIdsReason::UnknownPlayer,
                expected,
            });
        }
        if !allow_missing && expected.iter().any(|id| !self.participants.contains_key(id)) {
            return Err(SessionError::InvalidIds {
                reason: InvalidIdsReason::LessMembers,
                expected,
            });
        }

        let GameState {
            scene,
            global,
            leader,
            mut players,
        } = state;
        tracing::info!(checkpoint = name, %scene, "restoring checkpoint");

        self.globals = global;
        let notices: Vec<SessionEvent> = self
            .globals
            .iter()
            .map(|(stat_name, stat)| stat.to_event(stat_name))
            .collect();
        for notice in notices {
            self.broadcast(notice).await?;
        }

        let roster: Vec<(PlayerId, String)> = self
            .participants
            .values()
            .map(|p| (p.id, p.name.clone()))
            .collect();
        for (id, player_name) in roster {
            if let Some(saved) = players.remove(&id) {
                self.players
                    .insert(id, Player::from_state(id, &player_name, saved));
            }
        }

        let leader = if self.participants.contains_key(&leader) {
            Some(leader)
        } else if self.builder.game().vote_on_leader_death {
            tracing::info!(player_id = %leader, "saved leader absent, voting");
            self.vote_for_leader().await?
        } else {
            None
        };
        let leader = leader
            .or_else(|| self.lowest_id())
            .ok_or(SessionError::NoPlayerRemaining)?;
        self.switch_leader(leader).await?;
        Ok(scene)
    }

    /// Runs the steps of one scene and returns the scene to continue with.
    async fn play_scene(&mut self, id: SceneId) -> Result<Next, SessionError> {
        self.current_scene = Some(id);
        tracing::info!(scene = %id, "entering scene");
        self.broadcast(SessionEvent::SceneSwitch(id)).await?;

        let scene = self.builder.scene(id)?;
        for step in &scene {
            if !self.is_running() {
                return Ok(None);
            }
            match step(&mut *self).await {
                Ok(Some(next)) => return Ok(Some(next)),
                Ok(None) => {}
                Err(SessionError::Cancelled) => return Ok(None),
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    async fn shutdown(&mut self) -> Vec<Participant> {
        self.stop.stop();
        let frame = match SessionEvent::Stop.encode() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode stop notice");
                return std::mem::take(&mut self.participants).into_values().collect();
            }
        };

        let mut handed = Vec::with_capacity(self.participants.len());
        for (id, participant) in std::mem::take(&mut self.participants) {
            match participant.connection.send(&frame).await {
                Ok(()) => handed.push(participant),
                Err(e) => tracing::warn!(player_id = %id, error = %e, "dropping participant at stop"),
            }
        }
        handed
    }

    // -----------------------------------------------------------------------
    // Checkpoints
    // -----------------------------------------------------------------------

    /// The current game state, as a checkpoint would store it.
    pub fn snapshot(&self) -> Result<GameState, SessionError> {
        Ok(GameState {
            scene: self.current_scene.unwrap_or(INTRO_SCENE),
            global: self.globals.clone(),
            leader: self.leader()?,
            players: self
                .players
                .iter()
                .map(|(id, player)| (*id, player.state()))
                .collect(),
        })
    }

    /// Saves the current state and returns the name it was stored under.
    pub fn checkpoint(&self, name: &str) -> Result<String, SessionError> {
        match self.current_scene {
            Some(scene) if scene != INTRO_SCENE => {}
            _ => return Err(SessionError::IntroductionCheckpoint),
        }
        let state = self.snapshot()?;
        let stored = self
            .builder
            .save(name, &state)
            .map_err(SessionError::CheckpointSaving)?;
        tracing::info!(checkpoint = %stored, scene = %state.scene, "checkpoint saved");
        Ok(stored)
    }

    // -----------------------------------------------------------------------
    // Notices
    // -----------------------------------------------------------------------

    pub async fn print(&mut self, style: TextStyle, text: &str) -> Result<(), SessionError> {
        self.broadcast(SessionEvent::Text {
            style,
            text: text.to_string(),
        })
        .await
    }

    pub async fn print_to(
        &mut self,
        id: PlayerId,
        style: TextStyle,
        text: &str,
    ) -> Result<(), SessionError> {
        self.send(
            Target::Player(id),
            SessionEvent::Text {
                style,
                text: text.to_string(),
            },
        )
        .await
    }

    pub async fn send_global_stat(&mut self, name: &str) -> Result<(), SessionError> {
        let stat = self
            .globals
            .get(name)
            .ok_or_else(|| SessionError::UnknownStat(name.to_string()))?;
        let notice = stat.to_event(name);
        self.broadcast(notice).await
    }

    /// Announces what changed for `id` since the last announcement.
    pub async fn send_player_update(&mut self, id: PlayerId) -> Result<(), SessionError> {
        let state = self
            .players
            .get(&id)
            .ok_or(SessionError::UnknownPlayer(id))?
            .state();
        let previous = self.announced.get(&id);
        let diff = PlayerDiff::between(previous, &state);
        if previous.is_some() && diff.is_empty() {
            return Ok(());
        }
        let diff = serde_json::to_string(&diff)?;
        self.announced.insert(id, state);
        self.broadcast(SessionEvent::PlayerUpdate { player: id, diff })
            .await
    }

    /// Announces the death of `id` and disconnects them.
    ///
    /// # Errors
    /// [`SessionError::NoPlayerAlive`] when that was the last participant.
    pub async fn kill(&mut self, id: PlayerId, reason: &str) -> Result<(), SessionError> {
        if !self.participants.contains_key(&id) {
            return Err(SessionError::UnknownPlayer(id));
        }
        self.broadcast(SessionEvent::Die {
            player: id,
            reason: reason.to_string(),
        })
        .await?;

        if let Some(dead) = self.participants.remove(&id) {
            if let Err(e) = dead.connection.close().await {
                tracing::debug!(player_id = %id, error = %e, "close after death failed");
            }
        }
        self.players.remove(&id);
        self.announced.remove(&id);
        tracing::info!(player_id = %id, reason, "player died");

        if self.participants.is_empty() {
            return Err(SessionError::NoPlayerAlive);
        }
        self.drop_crashed(Vec::new()).await
    }

    /// Tests the game's death conditions against `id`'s stats. The first
    /// one met kills them with its message. Returns whether they died.
    ///
    /// # Errors
    /// [`SessionError::NoPlayerAlive`] when that was the last participant.
    pub async fn check_player(&mut self, id: PlayerId) -> Result<bool, SessionError> {
        let builder = Arc::clone(&self.builder);
        let stats = &self.player(id)?.stats;
        let mut death = None;
        for condition in &builder.game().death_conditions {
            if met(&condition.die_if, stats)? {
                death = Some(condition.message.as_str());
                break;
            }
        }
        let Some(message) = death else {
            return Ok(false);
        };
        self.kill(id, message).await?;
        Ok(true)
    }

    /// Tests the game's end conditions against the global stats. The first
    /// one met is announced and stops the session once the current step
    /// returns. Returns whether the game goes on.
    pub async fn check_game(&mut self) -> Result<bool, SessionError> {
        let builder = Arc::clone(&self.builder);
        for condition in &builder.game().game_end_conditions {
            if met(&condition.stop_if, &self.globals)? {
                tracing::info!(stat = %condition.stop_if.stat, "game end condition met");
                self.print(TextStyle::Important, &condition.message).await?;
                self.stop.stop();
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub async fn battle_init(&mut self, enemies_json: &str) -> Result<(), SessionError> {
        self.broadcast(SessionEvent::Battle(BattleEvent::Init(
            enemies_json.to_string(),
        )))
        .await
    }

    pub async fn battle_attack(
        &mut self,
        player: PlayerId,
        enemy: &str,
        damage: i32,
    ) -> Result<(), SessionError> {
        self.broadcast(SessionEvent::Battle(BattleEvent::Attack {
            player,
            enemy: enemy.to_string(),
            damage,
        }))
        .await
    }

    pub async fn battle_end(&mut self) -> Result<(), SessionError> {
        self.broadcast(SessionEvent::Battle(BattleEvent::End)).await
    }

    // -----------------------------------------------------------------------
    // Requests
    // -----------------------------------------------------------------------

    /// Asks for a number in `min..=max`.
    pub async fn ask_range(
        &mut self,
        target: Target,
        prompt: &str,
        min: u8,
        max: u8,
        policy: ReplyPolicy,
    ) -> Result<Replies, SessionError> {
        let validator: Validator = Arc::new(move |value| {
            if (min..=max).contains(&value) {
                Ok(())
            } else {
                Err(ReplyValidity::OutOfRange)
            }
        });
        self.request(target, prompt, RequestKind::Range { min, max }, validator, policy)
            .await
    }

    /// Asks for an index into `options`.
    pub async fn ask_options<S: AsRef<str>>(
        &mut self,
        target: Target,
        prompt: &str,
        options: &[S],
        policy: ReplyPolicy,
    ) -> Result<Replies, SessionError> {
        if options.is_empty() {
            return Err(ProtocolError::InvalidMessage("options request without options".into()).into());
        }
        let count = options.len();
        let validator: Validator = Arc::new(move |value| {
            if usize::from(value) < count {
                Ok(())
            } else {
                Err(ReplyValidity::OutOfRange)
            }
        });
        let kind = RequestKind::Options(options.iter().map(|o| o.as_ref().to_string()).collect());
        self.request(target, prompt, kind, validator, policy).await
    }

    /// Asks a yes/no question; replies are [`YES`](questline_protocol::YES)
    /// or [`NO`](questline_protocol::NO).
    pub async fn ask_yes_no(
        &mut self,
        target: Target,
        prompt: &str,
        policy: ReplyPolicy,
    ) -> Result<Replies, SessionError> {
        let validator: Validator = Arc::new(|value| {
            if value <= 1 {
                Ok(())
            } else {
                Err(ReplyValidity::OutOfRange)
            }
        });
        self.request(target, prompt, RequestKind::YesNo, validator, policy)
            .await
    }

    /// Waits until every target acknowledged.
    pub async fn ask_confirm(&mut self, target: Target, prompt: &str) -> Result<(), SessionError> {
        self.request(
            target,
            prompt,
            RequestKind::Confirm,
            confirm_validator(),
            ReplyPolicy::all(),
        )
        .await
        .map(|_| ())
    }

    /// Rolls `formula` once per target, shows the dice and waits for every
    /// target to acknowledge. Returns the rolls of targets still connected.
    pub async fn ask_dice_roll(
        &mut self,
        target: Target,
        prompt: &str,
        formula: DiceFormula,
    ) -> Result<BTreeMap<PlayerId, Roll>, SessionError> {
        let ids: Vec<PlayerId> = self.targets(target)?.into_iter().map(|(id, _)| id).collect();
        let mut rolls: BTreeMap<PlayerId, Roll> = ids
            .into_iter()
            .map(|id| (id, formula.roll(&mut self.rng)))
            .collect();
        let results = rolls
            .iter()
            .map(|(id, roll)| RollOutcome {
                player: *id,
                dice: roll.dice.clone(),
            })
            .collect();
        let kind = RequestKind::DiceRoll {
            dice: formula.dice,
            bonus: formula.bonus,
            results,
        };
        self.request(target, prompt, kind, confirm_validator(), ReplyPolicy::all())
            .await?;
        rolls.retain(|id, _| self.participants.contains_key(id));
        Ok(rolls)
    }

    /// Asks everyone to pick one option. The most voted option wins; ties
    /// are broken at random.
    pub async fn vote<S: AsRef<str>>(
        &mut self,
        prompt: &str,
        options: &[S],
    ) -> Result<usize, SessionError> {
        let replies = self
            .ask_options(Target::All, prompt, options, ReplyPolicy::all())
            .await?;
        let mut tally = vec![0usize; options.len()];
        for value in replies.values() {
            if let Some(count) = tally.get_mut(usize::from(*value)) {
                *count += 1;
            }
        }
        let best = tally.iter().copied().max().unwrap_or(0);
        let candidates: Vec<usize> = tally
            .iter()
            .enumerate()
            .filter(|(_, count)| **count == best)
            .map(|(index, _)| index)
            .collect();
        let choice = if candidates.len() == 1 {
            candidates[0]
        } else {
            candidates[self.rng.random_range(0..candidates.len())]
        };
        tracing::info!(choice, votes = best, "vote resolved");
        Ok(choice)
    }

    async fn request(
        &mut self,
        target: Target,
        prompt: &str,
        kind: RequestKind,
        validator: Validator,
        policy: ReplyPolicy,
    ) -> Result<Replies, SessionError> {
        if !self.is_running() {
            return Err(SessionError::Cancelled);
        }
        let targets = self.targets(target)?;
        let frame = SessionEvent::Request {
            target,
            prompt: prompt.to_string(),
            kind,
        }
        .encode()?;

        let outcome =
            request::correlate(targets, frame, validator, policy, self.stop_rx.clone()).await;
        self.drop_crashed(outcome.errored).await?;
        if outcome.cancelled {
            return Err(SessionError::Cancelled);
        }
        Ok(outcome.replies)
    }

    // -----------------------------------------------------------------------
    // Roster and ledger access
    // -----------------------------------------------------------------------

    /// The current leader.
    ///
    /// # Errors
    /// [`SessionError::NoLeader`] before the first election.
    pub fn leader(&self) -> Result<PlayerId, SessionError> {
        self.leader.ok_or(SessionError::NoLeader)
    }

    /// Ids of connected participants, ascending.
    pub fn participant_ids(&self) -> Vec<PlayerId> {
        self.participants.keys().copied().collect()
    }

    pub fn players(&self) -> impl Iterator<Item = &Player> {
        self.players.values()
    }

    pub fn player(&self, id: PlayerId) -> Result<&Player, SessionError> {
        self.players.get(&id).ok_or(SessionError::UnknownPlayer(id))
    }

    pub fn player_mut(&mut self, id: PlayerId) -> Result<&mut Player, SessionError> {
        self.players
            .get_mut(&id)
            .ok_or(SessionError::UnknownPlayer(id))
    }

    pub fn global_stat(&self, name: &str) -> Result<&Stat, SessionError> {
        self.globals
            .get(name)
            .ok_or_else(|| SessionError::UnknownStat(name.to_string()))
    }

    pub fn global_stat_mut(&mut self, name: &str) -> Result<&mut Stat, SessionError> {
        self.globals
            .get_mut(name)
            .ok_or_else(|| SessionError::UnknownStat(name.to_string()))
    }

    pub fn current_scene(&self) -> Option<SceneId> {
        self.current_scene
    }

    pub fn game(&self) -> &GameDescriptor {
        self.builder.game()
    }

    /// Rolls `formula` with the session's random source.
    pub fn roll(&mut self, formula: DiceFormula) -> Roll {
        formula.roll(&mut self.rng)
    }

    // -----------------------------------------------------------------------
    // Delivery and crash handling
    // -----------------------------------------------------------------------

    fn lowest_id(&self) -> Option<PlayerId> {
        self.participants.keys().next().copied()
    }

    fn targets(&self, target: Target) -> Result<Vec<(PlayerId, Arc<Connection>)>, SessionError> {
        let targets: Vec<_> = match target {
            Target::All => self
                .participants
                .values()
                .map(|p| (p.id, Arc::clone(&p.connection)))
                .collect(),
            Target::Player(id) => {
                let p = self
                    .participants
                    .get(&id)
                    .ok_or(SessionError::UnknownPlayer(id))?;
                vec![(id, Arc::clone(&p.connection))]
            }
        };
        if targets.is_empty() {
            return Err(SessionError::NoPlayerRemaining);
        }
        Ok(targets)
    }

    /// Writes `frame` to each target and returns the ids that failed.
    async fn deliver(&self, target: Target, frame: &[u8]) -> Result<Vec<PlayerId>, SessionError> {
        let mut failed = Vec::new();
        for (id, conn) in self.targets(target)? {
            if let Err(e) = conn.send(frame).await {
                tracing::warn!(player_id = %id, error = %e, "send failed");
                failed.push(id);
            }
        }
        Ok(failed)
    }

    async fn send(&mut self, target: Target, event: SessionEvent) -> Result<(), SessionError> {
        let frame = event.encode()?;
        let failed = self.deliver(target, &frame).await?;
        self.drop_crashed(failed).await
    }

    async fn broadcast(&mut self, event: SessionEvent) -> Result<(), SessionError> {
        self.send(Target::All, event).await
    }

    async fn switch_leader(&mut self, id: PlayerId) -> Result<(), SessionError> {
        self.leader = Some(id);
        tracing::info!(player_id = %id, "leader switched");
        self.broadcast(SessionEvent::LeaderSwitch(id)).await
    }

    /// Drops every failed participant, announces each crash and re-elects
    /// the leader if it was lost. Notices that fail in turn are handled in
    /// the same loop.
    async fn drop_crashed(&mut self, mut pending: Vec<PlayerId>) -> Result<(), SessionError> {
        loop {
            while let Some(id) = pending.pop() {
                if self.participants.remove(&id).is_none() {
                    continue;
                }
                self.players.remove(&id);
                self.announced.remove(&id);
                tracing::warn!(player_id = %id, "participant crashed");

                let frame = SessionEvent::Crash(id).encode()?;
                if !self.participants.is_empty() {
                    pending.extend(self.deliver(Target::All, &frame).await?);
                }
            }

            let Some(lowest) = self.lowest_id() else {
                return Err(SessionError::NoPlayerRemaining);
            };
            match self.leader {
                Some(leader) if !self.participants.contains_key(&leader) => {
                    self.leader = Some(lowest);
                    tracing::info!(player_id = %lowest, "leader switched");
                    let frame = SessionEvent::LeaderSwitch(lowest).encode()?;
                    pending.extend(self.deliver(Target::All, &frame).await?);
                    if pending.is_empty() {
                        return Ok(());
                    }
                }
                _ if pending.is_empty() => return Ok(()),
                _ => {}
            }
        }
    }
}

fn met(condition: &Condition, stats: &StatsManager) -> Result<bool, SessionError> {
    condition
        .test(stats)
        .ok_or_else(|| SessionError::UnknownStat(condition.stat.clone()))
}

/// `3` for fixed values, `2d6 + 1 = 9` for rolled ones.
fn roll_text(formula: DiceFormula, value: i32) -> String {
    if formula.dice == 0 {
        value.to_string()
    } else {
        format!("{}d6 + {} = {value}", formula.dice, formula.bonus)
    }
}

/// What a freshly rolled player is told about their character.
fn setup_lines(player: &Player, game: &GameDescriptor) -> Vec<String> {
    let mut lines = Vec::new();

    let stats: Vec<String> = game
        .player_stats
        .iter()
        .filter(|(_, descriptor)| !descriptor.hidden)
        .filter_map(|(name, descriptor)| {
            let stat = player.stats.get(name)?;
            Some(format!("{name}: {}", roll_text(descriptor.initial, stat.value)))
        })
        .collect();
    if !stats.is_empty() {
        lines.push(format!("{}'s stats:", player.name));
        lines.extend(stats);
    }

    if !game.inventories.is_empty() {
        lines.push(format!("{}'s inventories:", player.name));
    }
    for (name, descriptor) in &game.inventories {
        let Some(inventory) = player.inventories.get(name) else {
            continue;
        };
        let capacity = match (descriptor.capacity, inventory.capacity) {
            (Some(formula), Some(size)) => {
                roll_text(formula, i32::try_from(size).unwrap_or(i32::MAX))
            }
            _ => "unlimited".to_string(),
        };
        lines.push(format!("{name} capacity: {capacity}"));
        if !inventory.items.is_empty() {
            let items: Vec<String> = inventory
                .items
                .iter()
                .map(|(item, qty)| format!("{item}*{qty}"))
                .collect();
            lines.push(format!("{name} holds: {}", items.join(" ")));
        }
    }
    lines
}

fn confirm_validator() -> Validator {
    Arc::new(|value| {
        if value == 0 {
            Ok(())
        } else {
            Err(ReplyValidity::NotConfirm)
        }
    })
}
