//! Lobby actor: owns the member roster and drives session preparation.
//!
//! The lobby runs in its own task. Everything that happens to it arrives as
//! a [`LobbyCommand`] on one channel: connections that sent their
//! registration, requests read by per-member listener tasks, countdown
//! expiry and roster queries. Helper tasks never touch lobby state; they
//! only feed the channel.

use std::any::Any;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::FutureExt;

use questline_protocol::{
    ALL_PLAYERS, LobbyEvent, MemberInfo, MemberRequest, PlayerId, Registration,
    RegistrationResult, SessionEvent, SessionResult, YES, YesNoQuestion, parse_text,
};
use questline_session::{GameBuilder, Participant, RunParameters, Session, StopHandle};
use questline_transport::{Connection, ConnectionId, Transport, TransportError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::{CloseMode, LobbyConfig, LobbyError, LobbyState};

/// Pause before accepting again after a failed accept.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Commands delivered to the lobby actor.
pub(crate) enum LobbyCommand {
    /// A new connection sent its first message.
    Register {
        connection: Connection,
        request: Vec<u8>,
    },

    /// A member listener read something (or the connection ended).
    Request {
        id: PlayerId,
        connection: ConnectionId,
        received: Result<Option<Vec<u8>>, TransportError>,
    },

    /// The countdown with this generation ran out.
    CountdownElapsed { generation: u64 },

    /// Roster query.
    Members {
        reply: oneshot::Sender<Vec<MemberInfo>>,
    },
}

struct Member {
    name: String,
    ready: bool,
    connection: Arc<Connection>,
}

/// Why session preparation stopped early.
enum Interrupt {
    MasterLeft(PlayerId),
    Closing,
    Fault(LobbyError),
}

impl From<LobbyError> for Interrupt {
    fn from(e: LobbyError) -> Self {
        Self::Fault(e)
    }
}

type SessionSlot = Arc<Mutex<Option<StopHandle>>>;

// ---------------------------------------------------------------------------
// LobbyHandle
// ---------------------------------------------------------------------------

/// Handle to a running lobby. Cheap to clone.
#[derive(Clone)]
pub struct LobbyHandle {
    commands: mpsc::Sender<LobbyCommand>,
    state: watch::Receiver<LobbyState>,
    closing: Arc<watch::Sender<Option<CloseMode>>>,
    session: SessionSlot,
}

impl LobbyHandle {
    /// Returns the lobby's current state.
    pub fn state(&self) -> LobbyState {
        *self.state.borrow()
    }

    /// Returns a receiver that observes every state change.
    pub fn subscribe(&self) -> watch::Receiver<LobbyState> {
        self.state.clone()
    }

    /// Waits until the lobby reaches `target`.
    ///
    /// Fails with [`LobbyError::Unavailable`] if the actor exits first.
    pub async fn wait_for(&self, target: LobbyState) -> Result<(), LobbyError> {
        let mut state = self.state.clone();
        state
            .wait_for(|s| *s == target)
            .await
            .map(|_| ())
            .map_err(|_| LobbyError::Unavailable)
    }

    /// Returns the current roster.
    ///
    /// While a session is prepared or running the actor is busy, so the
    /// answer arrives once it is back to serving commands.
    pub async fn members(&self) -> Result<Vec<MemberInfo>, LobbyError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(LobbyCommand::Members { reply: reply_tx })
            .await
            .map_err(|_| LobbyError::Unavailable)?;
        reply_rx.await.map_err(|_| LobbyError::Unavailable)
    }

    /// Asks the lobby to close. Only the first request counts.
    ///
    /// A running session is stopped so its participants come back to the
    /// lobby, which then shuts them down according to `mode`.
    pub fn close(&self, mode: CloseMode) {
        let first = self.closing.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(mode);
                true
            } else {
                false
            }
        });
        if first {
            tracing::info!(?mode, "lobby close requested");
        }
        let slot = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(stop) = slot.as_ref() {
            stop.stop();
        }
    }
}

// ---------------------------------------------------------------------------
// Lobby
// ---------------------------------------------------------------------------

/// The lobby actor. Create with [`Lobby::new`], then spawn [`Lobby::run`].
pub struct Lobby<T: Transport> {
    transport: Arc<T>,
    builder: Arc<dyn GameBuilder>,
    config: LobbyConfig,
    rng: StdRng,

    state: LobbyState,
    state_tx: watch::Sender<LobbyState>,
    closing: watch::Receiver<Option<CloseMode>>,
    session: SessionSlot,

    commands: mpsc::Receiver<LobbyCommand>,
    tx: mpsc::Sender<LobbyCommand>,

    members: BTreeMap<PlayerId, Member>,
    listeners: HashMap<PlayerId, JoinHandle<()>>,
    acceptor: Option<JoinHandle<()>>,
    countdown: Option<JoinHandle<()>>,
    generation: u64,
}

impl<T: Transport> Lobby<T> {
    /// Creates a lobby over `transport` and the handle to control it.
    pub fn new(
        transport: T,
        builder: Arc<dyn GameBuilder>,
        config: LobbyConfig,
    ) -> (Self, LobbyHandle) {
        let (tx, commands) = mpsc::channel(config.command_buffer.max(1));
        let (state_tx, state_rx) = watch::channel(LobbyState::Closed);
        let (closing_tx, closing) = watch::channel(None);
        let session: SessionSlot = Arc::new(Mutex::new(None));
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        let handle = LobbyHandle {
            commands: tx.clone(),
            state: state_rx,
            closing: Arc::new(closing_tx),
            session: Arc::clone(&session),
        };
        let lobby = Self {
            transport: Arc::new(transport),
            builder,
            config,
            rng,
            state: LobbyState::Closed,
            state_tx,
            closing,
            session,
            commands,
            tx,
            members: BTreeMap::new(),
            listeners: HashMap::new(),
            acceptor: None,
            countdown: None,
            generation: 0,
        };
        (lobby, handle)
    }

    /// Runs the lobby until it is closed.
    ///
    /// An `Err` means the lobby failed; its members were dropped without
    /// notice.
    pub async fn run(mut self) -> Result<(), LobbyError> {
        tracing::info!(game = %self.builder.game().name, "lobby actor started");
        let result = self.serve().await;
        let mode = match &result {
            Ok(()) => self.close_mode().unwrap_or(CloseMode::Graceful),
            Err(e) => {
                tracing::error!(error = %e, "lobby failed");
                CloseMode::Crash
            }
        };
        self.shutdown(mode).await;
        tracing::info!(?mode, "lobby actor stopped");
        result
    }

    async fn serve(&mut self) -> Result<(), LobbyError> {
        self.open().await?;
        let mut closing = self.closing.clone();
        loop {
            let command = tokio::select! {
                biased;
                _ = close_requested(&mut closing) => return Ok(()),
                command = self.commands.recv() => command,
            };
            let Some(command) = command else {
                return Ok(());
            };
            self.handle(command).await?;
            if self.is_closing() {
                return Ok(());
            }
        }
    }

    async fn handle(&mut self, command: LobbyCommand) -> Result<(), LobbyError> {
        match command {
            LobbyCommand::Register {
                connection,
                request,
            } => self.register(connection, request).await,
            LobbyCommand::Request {
                id,
                connection,
                received,
            } => self.member_request(id, connection, received).await,
            LobbyCommand::CountdownElapsed { generation } => {
                if self.state == LobbyState::Starting && generation == self.generation {
                    self.prepare().await
                } else {
                    tracing::debug!(generation, "stale countdown ignored");
                    Ok(())
                }
            }
            LobbyCommand::Members { reply } => {
                let _ = reply.send(self.member_infos());
                Ok(())
            }
        }
    }

    // -----------------------------------------------------------------------
    // Registration and member requests
    // -----------------------------------------------------------------------

    async fn register(
        &mut self,
        connection: Connection,
        request: Vec<u8>,
    ) -> Result<(), LobbyError> {
        let verdict = match Registration::parse(&request) {
            Ok(registration) => self
                .check_registration(&registration)
                .map(|()| registration),
            Err(e) => {
                tracing::debug!(conn = %connection.id(), error = %e, "malformed registration");
                Err(RegistrationResult::InvalidRequest)
            }
        };
        let Registration { id, name } = match verdict {
            Ok(registration) => registration,
            Err(result) => return self.refuse(connection, result).await,
        };

        let notice = LobbyEvent::MemberRegistered {
            id,
            name: name.clone(),
        };
        let reply = LobbyEvent::Registration {
            result: RegistrationResult::Ok,
            members: self.member_infos(),
        }
        .encode();
        // A long name or a crowded roster may not fit a frame.
        let reply = match (reply, notice.encode()) {
            (Ok(reply), Ok(_)) => reply,
            (Err(e), _) | (_, Err(e)) => {
                tracing::warn!(player_id = %id, error = %e, "registration does not fit a frame");
                return self
                    .refuse(connection, RegistrationResult::InvalidRequest)
                    .await;
            }
        };
        if let Err(e) = connection.send(&reply).await {
            tracing::warn!(conn = %connection.id(), error = %e, "registration reply failed");
            return Ok(());
        }

        tracing::info!(player_id = %id, %name, conn = %connection.id(), "member registered");
        self.broadcast(notice).await?;
        self.members.insert(
            id,
            Member {
                name,
                ready: false,
                connection: Arc::new(connection),
            },
        );
        self.listen(id);

        // A departure during the broadcast may have started the countdown.
        if self.state == LobbyState::Starting && !self.all_ready() {
            let notice = self.cancel_countdown();
            self.broadcast(notice).await?;
        }
        Ok(())
    }

    fn check_registration(&self, registration: &Registration) -> Result<(), RegistrationResult> {
        if !self.state.is_registering() {
            return Err(RegistrationResult::UnavailableSession);
        }
        if registration.name.is_empty() || registration.id.0 == ALL_PLAYERS {
            return Err(RegistrationResult::InvalidRequest);
        }
        if self.members.contains_key(&registration.id) {
            return Err(RegistrationResult::UnavailableId);
        }
        if self.members.values().any(|m| m.name == registration.name) {
            return Err(RegistrationResult::UnavailableName);
        }
        Ok(())
    }

    async fn refuse(
        &self,
        connection: Connection,
        result: RegistrationResult,
    ) -> Result<(), LobbyError> {
        tracing::warn!(conn = %connection.id(), ?result, "registration refused");
        let reply = LobbyEvent::Registration {
            result,
            members: Vec::new(),
        }
        .encode()?;
        if let Err(e) = connection.send(&reply).await {
            tracing::debug!(conn = %connection.id(), error = %e, "refusal not delivered");
        }
        if let Err(e) = connection.close().await {
            tracing::debug!(conn = %connection.id(), error = %e, "close after refusal failed");
        }
        Ok(())
    }

    async fn member_request(
        &mut self,
        id: PlayerId,
        connection: ConnectionId,
        received: Result<Option<Vec<u8>>, TransportError>,
    ) -> Result<(), LobbyError> {
        match self.members.get(&id) {
            Some(member) if member.connection.id() == connection => {}
            _ => {
                tracing::debug!(player_id = %id, conn = %connection, "stale member request");
                return Ok(());
            }
        }

        let bytes = match received {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                tracing::info!(player_id = %id, "member connection closed");
                return self.disconnect(id, true).await;
            }
            Err(e) => {
                tracing::warn!(player_id = %id, error = %e, "member connection failed");
                return self.disconnect(id, true).await;
            }
        };

        match MemberRequest::parse(&bytes) {
            Ok(MemberRequest::Ready) => self.toggle_ready(id).await,
            Ok(MemberRequest::Disconnect) => self.disconnect(id, false).await,
            Err(e) => {
                tracing::warn!(player_id = %id, error = %e, "invalid member request");
                self.disconnect(id, true).await
            }
        }
    }

    async fn toggle_ready(&mut self, id: PlayerId) -> Result<(), LobbyError> {
        let Some(member) = self.members.get_mut(&id) else {
            return Ok(());
        };
        member.ready = !member.ready;
        tracing::info!(player_id = %id, ready = member.ready, "member readiness changed");

        let mut notices = vec![LobbyEvent::MemberReady(id)];
        if self.state == LobbyState::Open && self.all_ready() {
            notices.push(self.begin_countdown());
        } else if self.state == LobbyState::Starting && !self.all_ready() {
            notices.push(self.cancel_countdown());
        }
        self.broadcast_all(notices).await
    }

    /// Removes a member and tells the others. Graceful disconnects shut the
    /// connection down first; crashed ones are dropped as they are.
    async fn disconnect(&mut self, id: PlayerId, crash: bool) -> Result<(), LobbyError> {
        let Some(member) = self.remove_member(id) else {
            return Ok(());
        };
        if !crash {
            if let Err(e) = member.connection.close().await {
                tracing::debug!(player_id = %id, error = %e, "close failed");
            }
        }
        tracing::info!(player_id = %id, crash, "member disconnected");
        let notices = self.after_departure(id, crash);
        self.broadcast_all(notices).await
    }

    fn remove_member(&mut self, id: PlayerId) -> Option<Member> {
        if let Some(listener) = self.listeners.remove(&id) {
            listener.abort();
        }
        self.members.remove(&id)
    }

    /// State transition caused by a departure, followed by its notice.
    fn after_departure(&mut self, id: PlayerId, crash: bool) -> Vec<LobbyEvent> {
        let mut notices = Vec::with_capacity(2);
        if self.state == LobbyState::Starting && self.members.is_empty() {
            notices.push(self.cancel_countdown());
        } else if self.state == LobbyState::Open && self.all_ready() {
            notices.push(self.begin_countdown());
        }
        notices.push(if crash {
            LobbyEvent::MemberCrashed(id)
        } else {
            LobbyEvent::MemberDisconnected(id)
        });
        notices
    }

    fn all_ready(&self) -> bool {
        !self.members.is_empty() && self.members.values().all(|m| m.ready)
    }

    fn member_infos(&self) -> Vec<MemberInfo> {
        self.members
            .iter()
            .map(|(id, m)| MemberInfo {
                id: *id,
                name: m.name.clone(),
                ready: m.ready,
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Broadcasting
    // -----------------------------------------------------------------------

    async fn broadcast(&mut self, notice: LobbyEvent) -> Result<(), LobbyError> {
        self.broadcast_all(vec![notice]).await
    }

    /// Sends each notice to every member in id order. A member that cannot
    /// be reached is removed as crashed and its departure notices are
    /// queued behind the current ones.
    async fn broadcast_all(&mut self, notices: Vec<LobbyEvent>) -> Result<(), LobbyError> {
        let mut queue = VecDeque::from(notices);
        while let Some(notice) = queue.pop_front() {
            let frame = notice.encode()?;
            let targets: Vec<(PlayerId, Arc<Connection>)> = self
                .members
                .iter()
                .map(|(id, m)| (*id, Arc::clone(&m.connection)))
                .collect();
            for (id, connection) in targets {
                if let Err(e) = connection.send(&frame).await {
                    tracing::warn!(player_id = %id, error = %e, "lobby send failed");
                    if self.remove_member(id).is_some() {
                        queue.extend(self.after_departure(id, true));
                    }
                }
            }
        }
        Ok(())
    }

    /// Broadcast that fails with `MasterLeft` if it cost the master.
    async fn broadcast_checked(
        &mut self,
        master: PlayerId,
        notice: LobbyEvent,
    ) -> Result<(), Interrupt> {
        let present = self.members.contains_key(&master);
        self.broadcast(notice).await?;
        if present && !self.members.contains_key(&master) {
            return Err(Interrupt::MasterLeft(master));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Countdown
    // -----------------------------------------------------------------------

    fn begin_countdown(&mut self) -> LobbyEvent {
        self.stop_countdown_timer();
        self.set_state(LobbyState::Starting);
        self.generation += 1;

        let generation = self.generation;
        let delay = self.config.countdown;
        let commands = self.tx.clone();
        self.countdown = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = commands
                .send(LobbyCommand::CountdownElapsed { generation })
                .await;
        }));

        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        tracing::info!(delay_ms, "countdown started");
        LobbyEvent::BeginCountdown { delay_ms }
    }

    fn cancel_countdown(&mut self) -> LobbyEvent {
        self.stop_countdown_timer();
        self.generation += 1;
        self.set_state(LobbyState::Open);
        tracing::info!("countdown cancelled");
        LobbyEvent::CancelCountdown
    }

    fn stop_countdown_timer(&mut self) {
        if let Some(timer) = self.countdown.take() {
            timer.abort();
        }
    }

    // -----------------------------------------------------------------------
    // Background tasks
    // -----------------------------------------------------------------------

    fn start_acceptor(&mut self) {
        if self.acceptor.is_some() {
            return;
        }
        let transport = Arc::clone(&self.transport);
        let commands = self.tx.clone();
        self.acceptor = Some(tokio::spawn(async move {
            loop {
                match transport.accept().await {
                    Ok(connection) => {
                        tokio::spawn(read_registration(connection, commands.clone()));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                }
            }
        }));
    }

    async fn stop_acceptor(&mut self) {
        if let Some(acceptor) = self.acceptor.take() {
            acceptor.abort();
            let _ = acceptor.await;
        }
    }

    /// Spawns the task that forwards a member's messages to the actor. It
    /// stops after delivering the end of the connection.
    fn listen(&mut self, id: PlayerId) {
        let Some(member) = self.members.get(&id) else {
            return;
        };
        let connection = Arc::clone(&member.connection);
        let commands = self.tx.clone();
        let listener = tokio::spawn(async move {
            loop {
                let received = connection.recv().await;
                let last = !matches!(received, Ok(Some(_)));
                let command = LobbyCommand::Request {
                    id,
                    connection: connection.id(),
                    received,
                };
                if commands.send(command).await.is_err() || last {
                    break;
                }
            }
        });
        if let Some(previous) = self.listeners.insert(id, listener) {
            previous.abort();
        }
    }

    async fn stop_listeners(&mut self) {
        let listeners: Vec<JoinHandle<()>> = self.listeners.drain().map(|(_, l)| l).collect();
        for listener in listeners {
            listener.abort();
            let _ = listener.await;
        }
    }

    /// Handles what queued up before the actor went busy. Late
    /// registrations are refused; disconnects still count.
    ///
    /// Ready toggles and disconnect requests that arrive once the countdown
    /// has elapsed are dropped: readiness is reset after every session and
    /// the roster is already fixed for this one. The member sees the
    /// preparation notices instead of a `MemberReady` echo.
    async fn drain_commands(&mut self) -> Result<(), LobbyError> {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                LobbyCommand::Register { connection, .. } => {
                    self.refuse(connection, RegistrationResult::UnavailableSession)
                        .await?;
                }
                LobbyCommand::Request {
                    id,
                    received: Ok(Some(_)),
                    ..
                } => {
                    tracing::info!(
                        player_id = %id,
                        "member request dropped, countdown already elapsed"
                    );
                }
                LobbyCommand::Request {
                    id,
                    connection,
                    received,
                } => self.member_request(id, connection, received).await?,
                LobbyCommand::Members { reply } => {
                    let _ = reply.send(self.member_infos());
                }
                LobbyCommand::CountdownElapsed { .. } => {}
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Open / prepare / close
    // -----------------------------------------------------------------------

    async fn open(&mut self) -> Result<(), LobbyError> {
        self.set_state(LobbyState::Open);
        self.broadcast(LobbyEvent::Open).await?;
        self.start_acceptor();
        let ids: Vec<PlayerId> = self.members.keys().copied().collect();
        for id in ids {
            self.listen(id);
        }
        Ok(())
    }

    async fn prepare(&mut self) -> Result<(), LobbyError> {
        self.set_state(LobbyState::Preparing);
        self.stop_countdown_timer();
        self.stop_acceptor().await;
        self.stop_listeners().await;
        self.drain_commands().await?;

        match self.negotiate().await {
            Ok(()) | Err(Interrupt::Closing) => {}
            Err(Interrupt::MasterLeft(master)) => {
                tracing::warn!(player_id = %master, "master left during preparation");
                self.broadcast(LobbyEvent::MasterDisconnected).await?;
                for member in self.members.values_mut() {
                    member.ready = false;
                }
            }
            Err(Interrupt::Fault(e)) => return Err(e),
        }

        if self.is_closing() {
            return Ok(());
        }
        self.open().await
    }

    async fn negotiate(&mut self) -> Result<(), Interrupt> {
        let Some(master) = self.members.keys().next().copied() else {
            return Ok(());
        };
        tracing::info!(player_id = %master, "preparing session");
        self.broadcast_checked(master, LobbyEvent::SessionPreparation { master })
            .await?;
        self.make_session(master).await
    }

    /// Picks the run parameters with the master and runs sessions until
    /// one ends for good or the master gives up.
    async fn make_session(&mut self, master: PlayerId) -> Result<(), Interrupt> {
        let mut checkpoint: Option<String> = None;
        let mut allow_missing: Option<bool> = None;

        loop {
            let name = match checkpoint.take() {
                Some(name) => name,
                None => {
                    self.broadcast_checked(master, LobbyEvent::SelectingCheckpoint)
                        .await?;
                    self.ask_checkpoint(master).await?
                }
            };
            let missing = match allow_missing.take() {
                Some(missing) => missing,
                None => {
                    self.broadcast_checked(master, LobbyEvent::CheckingPlayers)
                        .await?;
                    !name.is_empty()
                        && self
                            .ask_yes_no(master, YesNoQuestion::MissingEntrants)
                            .await?
                }
            };

            let (result, expected) = self.run_session(master, &name, missing).await?;
            self.broadcast_checked(
                master,
                LobbyEvent::RunResult {
                    result,
                    expected: expected.clone(),
                },
            )
            .await?;
            if result.is_parameters_error() {
                self.broadcast_checked(master, LobbyEvent::RevisingParameters)
                    .await?;
            }

            match result {
                SessionResult::Ok | SessionResult::Crashed => return Ok(()),
                SessionResult::CheckpointLoadingError => {}
                SessionResult::LessMembers => {
                    if self
                        .ask_yes_no(master, YesNoQuestion::MissingEntrants)
                        .await?
                    {
                        checkpoint = Some(name);
                        allow_missing = Some(true);
                    } else if !self.ask_yes_no(master, YesNoQuestion::RetryCheckpoint).await? {
                        return Ok(());
                    }
                }
                SessionResult::UnknownPlayer => {
                    if self
                        .ask_yes_no(master, YesNoQuestion::KickUnknownPlayers)
                        .await?
                    {
                        self.kick_unknown(master, &expected).await?;
                        checkpoint = Some(name);
                    } else if !self.ask_yes_no(master, YesNoQuestion::RetryCheckpoint).await? {
                        return Ok(());
                    }
                }
                SessionResult::NoPlayerAlive => {
                    if !self.ask_yes_no(master, YesNoQuestion::RetryCheckpoint).await? {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn kick_unknown(
        &mut self,
        master: PlayerId,
        expected: &[PlayerId],
    ) -> Result<(), Interrupt> {
        if !expected.contains(&master) {
            tracing::info!(player_id = %master, "master unknown to checkpoint");
            self.disconnect(master, false).await?;
            return Err(Interrupt::MasterLeft(master));
        }
        let unknown: Vec<PlayerId> = self
            .members
            .keys()
            .filter(|id| !expected.contains(id))
            .copied()
            .collect();
        for id in unknown {
            tracing::info!(player_id = %id, "kicking member unknown to checkpoint");
            self.disconnect(id, false).await?;
        }
        Ok(())
    }

    async fn ask_checkpoint(&mut self, master: PlayerId) -> Result<String, Interrupt> {
        let answer = self.ask_master(master, LobbyEvent::AskCheckpoint).await?;
        match parse_text(&answer) {
            Ok(name) => Ok(name),
            Err(e) => {
                tracing::warn!(player_id = %master, error = %e, "invalid checkpoint name");
                self.disconnect(master, true).await?;
                Err(Interrupt::MasterLeft(master))
            }
        }
    }

    /// Any answer whose first byte is not `YES` counts as no.
    async fn ask_yes_no(
        &mut self,
        master: PlayerId,
        question: YesNoQuestion,
    ) -> Result<bool, Interrupt> {
        let answer = self
            .ask_master(master, LobbyEvent::AskYesNo(question))
            .await?;
        Ok(answer.first() == Some(&YES))
    }

    async fn ask_master(
        &mut self,
        master: PlayerId,
        question: LobbyEvent,
    ) -> Result<Vec<u8>, Interrupt> {
        let frame = question.encode().map_err(LobbyError::from)?;
        let Some(connection) = self
            .members
            .get(&master)
            .map(|m| Arc::clone(&m.connection))
        else {
            return Err(Interrupt::MasterLeft(master));
        };
        if let Err(e) = connection.send(&frame).await {
            tracing::warn!(player_id = %master, error = %e, "question to master failed");
            self.disconnect(master, true).await?;
            return Err(Interrupt::MasterLeft(master));
        }

        let mut closing = self.closing.clone();
        let received = tokio::select! {
            biased;
            _ = close_requested(&mut closing) => return Err(Interrupt::Closing),
            received = connection.recv() => received,
        };
        match received {
            Ok(Some(answer)) => Ok(answer),
            Ok(None) => {
                tracing::info!(player_id = %master, "master connection closed");
                self.disconnect(master, true).await?;
                Err(Interrupt::MasterLeft(master))
            }
            Err(e) => {
                tracing::warn!(player_id = %master, error = %e, "master connection failed");
                self.disconnect(master, true).await?;
                Err(Interrupt::MasterLeft(master))
            }
        }
    }

    /// Hands every member to a fresh session and takes back whoever is
    /// still connected when it ends.
    async fn run_session(
        &mut self,
        master: PlayerId,
        checkpoint: &str,
        allow_missing: bool,
    ) -> Result<(SessionResult, Vec<PlayerId>), Interrupt> {
        tracing::info!(checkpoint, allow_missing, "starting session");
        self.broadcast_checked(master, LobbyEvent::Start).await?;
        if self.is_closing() {
            return Err(Interrupt::Closing);
        }

        let participants: Vec<Participant> = std::mem::take(&mut self.members)
            .into_iter()
            .map(|(id, m)| Participant {
                id,
                name: m.name,
                connection: m.connection,
            })
            .collect();
        // Kept to take members back if the session panics.
        let handed: Vec<Participant> = participants
            .iter()
            .map(|p| Participant {
                id: p.id,
                name: p.name.clone(),
                connection: Arc::clone(&p.connection),
            })
            .collect();
        let params = RunParameters {
            checkpoint: (!checkpoint.is_empty()).then(|| checkpoint.to_string()),
            allow_missing,
        };

        let mut session = Session::new(
            Arc::clone(&self.builder),
            StdRng::seed_from_u64(self.rng.random()),
        );
        self.register_session(Some(session.stop_handle()));
        if self.is_closing() {
            session.stop_handle().stop();
        }
        self.set_state(LobbyState::Running);
        let run = AssertUnwindSafe(session.run(participants, params))
            .catch_unwind()
            .await;
        self.register_session(None);
        self.set_state(LobbyState::Preparing);

        let (returned, verdict) = match run {
            Ok(outcome) => {
                let verdict = match outcome.result {
                    Ok(()) => (SessionResult::Ok, Vec::new()),
                    Err(e) => (e.session_result(), e.expected_ids().to_vec()),
                };
                (outcome.participants, verdict)
            }
            Err(panic) => {
                tracing::error!(reason = panic_message(panic.as_ref()), "session panicked");
                (reclaim(handed).await, (SessionResult::Crashed, Vec::new()))
            }
        };
        for participant in returned {
            self.members.insert(
                participant.id,
                Member {
                    name: participant.name,
                    ready: false,
                    connection: participant.connection,
                },
            );
        }
        tracing::info!(result = ?verdict.0, members = self.members.len(), "session ended");
        Ok(verdict)
    }

    async fn shutdown(&mut self, mode: CloseMode) {
        self.set_state(LobbyState::Closed);
        self.stop_countdown_timer();
        self.stop_acceptor().await;
        self.stop_listeners().await;
        match mode {
            CloseMode::Graceful => {
                let ids: Vec<PlayerId> = self.members.keys().copied().collect();
                for id in ids {
                    if let Err(e) = self.disconnect(id, false).await {
                        tracing::error!(player_id = %id, error = %e, "graceful disconnect failed");
                    }
                }
            }
            CloseMode::Crash => self.members.clear(),
        }
    }

    // -----------------------------------------------------------------------
    // Small helpers
    // -----------------------------------------------------------------------

    fn set_state(&mut self, state: LobbyState) {
        if self.state != state {
            tracing::debug!(from = %self.state, to = %state, "lobby state changed");
        }
        self.state = state;
        self.state_tx.send_replace(state);
    }

    fn close_mode(&self) -> Option<CloseMode> {
        *self.closing.borrow()
    }

    fn is_closing(&self) -> bool {
        self.close_mode().is_some()
    }

    fn register_session(&self, stop: Option<StopHandle>) {
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = stop;
    }
}

/// Resolves once a close was requested or the last handle is gone.
async fn close_requested(closing: &mut watch::Receiver<Option<CloseMode>>) {
    let _ = closing.wait_for(Option::is_some).await;
}

/// Ends a session that died without its stop notice. Participants the
/// notice cannot reach are left behind.
async fn reclaim(handed: Vec<Participant>) -> Vec<Participant> {
    let frame = match SessionEvent::Stop.encode() {
        Ok(frame) => frame,
        Err(e) => {
            tracing::error!(error = %e, "failed to encode stop notice");
            return handed;
        }
    };
    let mut reclaimed = Vec::with_capacity(handed.len());
    for participant in handed {
        match participant.connection.send(&frame).await {
            Ok(()) => reclaimed.push(participant),
            Err(e) => tracing::warn!(
                player_id = %participant.id,
                error = %e,
                "participant lost with the session"
            ),
        }
    }
    reclaimed
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// Reads a fresh connection's first message and hands it to the actor.
async fn read_registration(connection: Connection, commands: mpsc::Sender<LobbyCommand>) {
    match connection.recv().await {
        Ok(Some(request)) => {
            let _ = commands
                .send(LobbyCommand::Register {
                    connection,
                    request,
                })
                .await;
        }
        Ok(None) => {
            tracing::debug!(conn = %connection.id(), "connection closed before registering");
        }
        Err(e) => {
            tracing::debug!(conn = %connection.id(), error = %e, "registration read failed");
        }
    }
}
