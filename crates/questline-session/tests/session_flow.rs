//! End-to-end session runs over in-memory connections.
//!
//! Each participant is one end of a `tokio::io::duplex` pipe. The other end
//! is driven by a small scripted client task that records every event it
//! receives and answers requests.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use questline_protocol::{
    PlayerId, RequestKind, SceneId, SessionEvent, Target, TextStyle,
};
use questline_session::{
    CheckpointError, Comparison, Condition, DeathCondition, DiceFormula, EndCondition,
    GameBuilder, GameDescriptor, GameState, InvalidIdsReason, InventoryDescriptor, Participant,
    PlayerState, ReplyPolicy, RunParameters, Scene, SceneProvider, Session, SessionError, Stat,
    StatDescriptor, StatLimits, StatsManager, step,
};
use questline_transport::Connection;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

// =========================================================================
// Helpers
// =========================================================================

fn pid(id: u8) -> PlayerId {
    PlayerId(id)
}

struct TestGame {
    game: GameDescriptor,
    scenes: fn(SceneId) -> Option<Scene>,
    saves: Mutex<HashMap<String, GameState>>,
}

impl TestGame {
    fn new(vote_leader: bool, scenes: fn(SceneId) -> Option<Scene>) -> Arc<Self> {
        Self::configured(scenes, |game| game.vote_leader = vote_leader)
    }

    fn configured(
        scenes: fn(SceneId) -> Option<Scene>,
        configure: impl FnOnce(&mut GameDescriptor),
    ) -> Arc<Self> {
        let fixed = |value, max| StatDescriptor {
            initial: DiceFormula::fixed(value),
            limits: StatLimits { min: 0, max },
            capped: false,
            hidden: false,
            main: true,
        };
        let mut game = GameDescriptor {
            name: "test quest".into(),
            global_stats: vec![("doom".into(), fixed(3, 10))],
            player_stats: vec![("hp".into(), fixed(10, 10))],
            ..GameDescriptor::default()
        };
        configure(&mut game);
        Arc::new(Self {
            game,
            scenes,
            saves: Mutex::new(HashMap::new()),
        })
    }

    fn insert_save(&self, name: &str, state: GameState) {
        self.saves.lock().unwrap().insert(name.to_string(), state);
    }

    fn saved(&self, name: &str) -> Option<GameState> {
        self.saves.lock().unwrap().get(name).cloned()
    }
}

impl SceneProvider for TestGame {
    fn scene(&self, id: SceneId) -> Result<Scene, SessionError> {
        (self.scenes)(id).ok_or(SessionError::UnknownScene(id))
    }
}

impl GameBuilder for TestGame {
    fn game(&self) -> &GameDescriptor {
        &self.game
    }

    fn load(&self, name: &str) -> Result<GameState, CheckpointError> {
        self.saved(name)
            .ok_or_else(|| CheckpointError::NotFound(name.to_string()))
    }

    fn save(&self, name: &str, state: &GameState) -> Result<String, CheckpointError> {
        let mut saves = self.saves.lock().unwrap();
        let mut stored = name.to_string();
        let mut suffix = 1;
        while saves.contains_key(&stored) {
            stored = format!("{name}_{suffix}");
            suffix += 1;
        }
        saves.insert(stored.clone(), state.clone());
        Ok(stored)
    }
}

/// Scene 0 and 1 exist and do nothing.
fn empty_scenes(id: SceneId) -> Option<Scene> {
    (id.0 <= 1).then(Vec::new)
}

fn session(game: &Arc<TestGame>) -> Session {
    Session::new(Arc::clone(game) as Arc<dyn GameBuilder>, StdRng::seed_from_u64(11))
}

fn connect(players: &[(u8, &str)]) -> (Vec<Participant>, Vec<DuplexStream>) {
    players
        .iter()
        .map(|(id, name)| {
            let (server, client) = tokio::io::duplex(1 << 16);
            let participant = Participant {
                id: pid(*id),
                name: name.to_string(),
                connection: Arc::new(Connection::from_stream(server)),
            };
            (participant, client)
        })
        .unzip()
}

async fn read_event(stream: &mut DuplexStream) -> Option<SessionEvent> {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await.ok()?;
    let mut frame = header.to_vec();
    frame.resize(2 + u16::from_be_bytes(header) as usize, 0);
    stream.read_exact(&mut frame[2..]).await.ok()?;
    Some(SessionEvent::decode(&frame).unwrap())
}

/// Answers every request (`min` for ranges, `answer` otherwise) until the
/// stop notice or end of stream.
fn bot(mut stream: DuplexStream, answer: u8) -> JoinHandle<Vec<SessionEvent>> {
    tokio::spawn(async move {
        let mut seen = Vec::new();
        while let Some(event) = read_event(&mut stream).await {
            if let SessionEvent::Request { kind, .. } = &event {
                let value = match kind {
                    RequestKind::Range { min, .. } => *min,
                    RequestKind::Confirm | RequestKind::DiceRoll { .. } => 0,
                    _ => answer,
                };
                stream.write_all(&[value]).await.unwrap();
            }
            let stop = event == SessionEvent::Stop;
            seen.push(event);
            if stop {
                break;
            }
        }
        seen
    })
}

/// Drops its connection as soon as a request arrives.
fn crasher(mut stream: DuplexStream) -> JoinHandle<Vec<SessionEvent>> {
    tokio::spawn(async move {
        let mut seen = Vec::new();
        while let Some(event) = read_event(&mut stream).await {
            let request = matches!(event, SessionEvent::Request { .. });
            seen.push(event);
            if request {
                break;
            }
        }
        seen
    })
}

/// Never answers; reports the first request it sees.
fn silent(mut stream: DuplexStream, asked: oneshot::Sender<()>) -> JoinHandle<Vec<SessionEvent>> {
    tokio::spawn(async move {
        let mut asked = Some(asked);
        let mut seen = Vec::new();
        while let Some(event) = read_event(&mut stream).await {
            if matches!(event, SessionEvent::Request { .. }) {
                if let Some(tx) = asked.take() {
                    tx.send(()).unwrap();
                }
            }
            let stop = event == SessionEvent::Stop;
            seen.push(event);
            if stop {
                break;
            }
        }
        seen
    })
}

fn saved_state(ids: &[u8], scene: u16, leader: u8) -> GameState {
    let mut global = StatsManager::new();
    global.insert(
        "doom",
        Stat {
            value: 7,
            limits: StatLimits { min: 0, max: 10 },
            hidden: false,
            main: true,
        },
    );
    GameState {
        scene: SceneId(scene),
        global,
        leader: pid(leader),
        players: ids.iter().map(|id| (pid(*id), PlayerState::default())).collect(),
    }
}

// =========================================================================
// New game
// =========================================================================

fn story_scenes(id: SceneId) -> Option<Scene> {
    match id.0 {
        0 => Some(vec![step(|s| {
            Box::pin(async move {
                s.print(TextStyle::Title, "Prologue").await?;
                Ok(None)
            })
        })]),
        1 => Some(vec![
            step(|s| {
                Box::pin(async move {
                    let replies = s
                        .ask_range(Target::All, "How brave?", 2, 6, ReplyPolicy::all())
                        .await?;
                    let total: i32 = replies.values().map(|v| i32::from(*v)).sum();
                    s.global_stat_mut("doom")?.set(total);
                    s.send_global_stat("doom").await?;
                    Ok(None)
                })
            }),
            step(|_| Box::pin(async { Ok(Some(SceneId(2))) })),
            step(|s| {
                Box::pin(async move {
                    // Skipped: the previous step jumped away.
                    s.global_stat_mut("doom")?.set(0);
                    Ok(None)
                })
            }),
        ]),
        2 => Some(vec![step(|s| {
            Box::pin(async move {
                s.print(TextStyle::Normal, "The end").await?;
                Ok(None)
            })
        })]),
        _ => None,
    }
}

#[tokio::test]
async fn test_run_new_game_plays_scenes_until_none_left() {
    let game = TestGame::new(false, story_scenes);
    let mut session = session(&game);
    let (participants, streams) = connect(&[(2, "bob"), (1, "ann")]);
    let bots: Vec<_> = streams.into_iter().map(|s| bot(s, 0)).collect();

    let outcome = session.run(participants, RunParameters::new_game()).await;
    assert!(outcome.result.is_ok(), "{:?}", outcome.result);
    assert_eq!(outcome.participants.len(), 2);

    assert_eq!(session.leader().unwrap(), pid(1));
    assert_eq!(session.global_stat("doom").unwrap().value, 4);
    assert_eq!(session.players().count(), 2);
    assert_eq!(session.player(pid(2)).unwrap().stats.get("hp").unwrap().value, 10);

    for handle in bots {
        let events = handle.await.unwrap();
        assert_eq!(
            events.first(),
            Some(&SessionEvent::Start {
                game: "test quest".into()
            })
        );
        assert_eq!(events.last(), Some(&SessionEvent::Stop));
        let scenes: Vec<SceneId> = events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::SceneSwitch(id) => Some(*id),
                _ => None,
            })
            .collect();
        assert_eq!(scenes, vec![SceneId(0), SceneId(1), SceneId(2)]);
        assert!(events.contains(&SessionEvent::LeaderSwitch(pid(1))));
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, SessionEvent::PlayerUpdate { .. }))
                .count(),
            2
        );
    }
}

#[tokio::test]
async fn test_run_twice_is_refused_and_returns_connections() {
    let game = TestGame::new(false, empty_scenes);
    let mut session = session(&game);
    let (participants, streams) = connect(&[(1, "ann")]);
    let bots: Vec<_> = streams.into_iter().map(|s| bot(s, 0)).collect();
    let first = session.run(participants, RunParameters::new_game()).await;
    assert!(first.result.is_ok());

    let second = session.run(first.participants, RunParameters::new_game()).await;
    assert!(matches!(second.result, Err(SessionError::AlreadyStarted)));
    assert_eq!(second.participants.len(), 1);
    drop(bots);
}

#[tokio::test]
async fn test_new_game_vote_leader_elects_most_voted() {
    let game = TestGame::new(true, empty_scenes);
    let mut session = session(&game);
    let (participants, streams) = connect(&[(1, "ann"), (4, "bob"), (9, "cid")]);
    // Everyone votes for the third option, "cid".
    let bots: Vec<_> = streams.into_iter().map(|s| bot(s, 2)).collect();

    let outcome = session.run(participants, RunParameters::new_game()).await;
    assert!(outcome.result.is_ok());
    assert_eq!(session.leader().unwrap(), pid(9));

    let events = bots.into_iter().next().unwrap().await.unwrap();
    assert!(events.iter().any(|e| matches!(
        e,
        SessionEvent::Request { kind: RequestKind::Options(names), .. } if names == &["ann", "bob", "cid"]
    )));
}

// =========================================================================
// Checkpoints
// =========================================================================

fn checkpoint_scenes(id: SceneId) -> Option<Scene> {
    match id.0 {
        0 => Some(vec![]),
        1 => Some(vec![
            step(|s| {
                Box::pin(async move {
                    if let Some(hp) = s.player_mut(pid(2))?.stats.get_mut("hp") {
                        hp.set(4);
                    }
                    s.global_stat_mut("doom")?.add(2);
                    s.send_player_update(pid(2)).await?;
                    s.checkpoint("camp")?;
                    Ok(Some(SceneId(2)))
                })
            }),
        ]),
        2 => Some(vec![]),
        _ => None,
    }
}

#[tokio::test]
async fn test_checkpoint_roundtrip_restores_state() {
    let game = TestGame::new(false, checkpoint_scenes);

    let mut first = session(&game);
    let (participants, streams) = connect(&[(1, "ann"), (2, "bob")]);
    let bots: Vec<_> = streams.into_iter().map(|s| bot(s, 0)).collect();
    let outcome = first.run(participants, RunParameters::new_game()).await;
    assert!(outcome.result.is_ok(), "{:?}", outcome.result);
    for handle in bots {
        handle.await.unwrap();
    }

    let saved = game.saved("camp").expect("checkpoint stored");
    assert_eq!(saved.scene, SceneId(1));
    assert_eq!(saved.leader, pid(1));
    assert_eq!(saved.global.get("doom").unwrap().value, 5);
    assert_eq!(saved.players[&pid(2)].stats.get("hp").unwrap().value, 4);

    let mut second = session(&game);
    let (participants, streams) = connect(&[(1, "ann"), (2, "bob")]);
    let bots: Vec<_> = streams.into_iter().map(|s| bot(s, 0)).collect();
    let outcome = second.run(participants, RunParameters::restore("camp")).await;
    assert!(outcome.result.is_ok(), "{:?}", outcome.result);

    // Restored at scene 1, which checkpoints again under a fresh name.
    assert_eq!(second.player(pid(2)).unwrap().stats.get("hp").unwrap().value, 4);
    assert_eq!(second.global_stat("doom").unwrap().value, 7);
    assert!(game.saved("camp_1").is_some());

    let events = bots.into_iter().next().unwrap().await.unwrap();
    assert!(!events.contains(&SessionEvent::SceneSwitch(SceneId(0))));
    assert!(events.contains(&SessionEvent::SceneSwitch(SceneId(1))));
}

#[tokio::test]
async fn test_checkpoint_during_intro_is_refused() {
    fn scenes(id: SceneId) -> Option<Scene> {
        (id.0 == 0).then(|| {
            vec![step(|s| {
                Box::pin(async move {
                    s.checkpoint("too early")?;
                    Ok(None)
                })
            })]
        })
    }
    let game = TestGame::new(false, scenes);
    let mut session = session(&game);
    let (participants, streams) = connect(&[(1, "ann")]);
    let bots: Vec<_> = streams.into_iter().map(|s| bot(s, 0)).collect();

    let outcome = session.run(participants, RunParameters::new_game()).await;
    assert!(matches!(
        outcome.result,
        Err(SessionError::IntroductionCheckpoint)
    ));
    assert!(game.saved("too early").is_none());
    assert_eq!(outcome.participants.len(), 1);

    let events = bots.into_iter().next().unwrap().await.unwrap();
    assert_eq!(events.last(), Some(&SessionEvent::Stop));
}

#[tokio::test]
async fn test_restore_missing_checkpoint_fails_loading() {
    let game = TestGame::new(false, empty_scenes);
    let mut session = session(&game);
    let (participants, streams) = connect(&[(1, "ann")]);
    let _bots: Vec<_> = streams.into_iter().map(|s| bot(s, 0)).collect();

    let outcome = session.run(participants, RunParameters::restore("nowhere")).await;
    assert!(matches!(
        outcome.result,
        Err(SessionError::CheckpointLoading(CheckpointError::NotFound(_)))
    ));
    assert_eq!(outcome.participants.len(), 1);
}

#[tokio::test]
async fn test_restore_with_unknown_participant_reports_expected_ids() {
    let game = TestGame::new(false, empty_scenes);
    game.insert_save("save", saved_state(&[2, 1], 1, 1));
    let mut session = session(&game);
    let (participants, streams) = connect(&[(1, "ann"), (3, "cid")]);
    let bots: Vec<_> = streams.into_iter().map(|s| bot(s, 0)).collect();

    let outcome = session.run(participants, RunParameters::restore("save")).await;
    match outcome.result {
        Err(SessionError::InvalidIds { reason, expected }) => {
            assert_eq!(reason, InvalidIdsReason::UnknownPlayer);
            assert_eq!(expected, vec![pid(1), pid(2)]);
        }
        other => panic!("unexpected result {other:?}"),
    }
    assert_eq!(outcome.participants.len(), 2);

    for handle in bots {
        let events = handle.await.unwrap();
        assert!(matches!(events.first(), Some(SessionEvent::Start { .. })));
        assert_eq!(events.last(), Some(&SessionEvent::Stop));
    }
}

#[tokio::test]
async fn test_restore_with_missing_participant_needs_permission() {
    let game = TestGame::new(false, empty_scenes);
    game.insert_save("save", saved_state(&[1, 2], 1, 2));

    let mut refused = session(&game);
    let (participants, streams) = connect(&[(1, "ann")]);
    let _bots: Vec<_> = streams.into_iter().map(|s| bot(s, 0)).collect();
    let outcome = refused.run(participants, RunParameters::restore("save")).await;
    assert!(matches!(
        outcome.result,
        Err(SessionError::InvalidIds {
            reason: InvalidIdsReason::LessMembers,
            ..
        })
    ));

    let mut allowed = session(&game);
    let (participants, streams) = connect(&[(1, "ann")]);
    let _bots: Vec<_> = streams.into_iter().map(|s| bot(s, 0)).collect();
    let params = RunParameters {
        checkpoint: Some("save".into()),
        allow_missing: true,
    };
    let outcome = allowed.run(participants, params).await;
    assert!(outcome.result.is_ok(), "{:?}", outcome.result);
    // The saved leader is absent, so the lowest connected id leads.
    assert_eq!(allowed.leader().unwrap(), pid(1));
    assert_eq!(allowed.global_stat("doom").unwrap().value, 7);
}

// =========================================================================
// Crashes, deaths and stopping
// =========================================================================

fn ask_scenes(id: SceneId) -> Option<Scene> {
    match id.0 {
        0 => Some(vec![]),
        1 => Some(vec![step(|s| {
            Box::pin(async move {
                let replies = s
                    .ask_range(Target::All, "Pick", 1, 3, ReplyPolicy::all())
                    .await?;
                let ids: Vec<PlayerId> = replies.keys().copied().collect();
                s.global_stat_mut("doom")?.set(ids.len() as i32);
                Ok(None)
            })
        })]),
        _ => None,
    }
}

#[tokio::test]
async fn test_leader_crash_reelects_lowest_remaining() {
    let game = TestGame::new(false, ask_scenes);
    let mut session = session(&game);
    let (participants, mut streams) = connect(&[(1, "ann"), (2, "bob"), (3, "cid")]);
    let third = bot(streams.pop().unwrap(), 0);
    let second = bot(streams.pop().unwrap(), 0);
    let first = crasher(streams.pop().unwrap());

    let outcome = session.run(participants, RunParameters::new_game()).await;
    assert!(outcome.result.is_ok(), "{:?}", outcome.result);
    assert_eq!(outcome.participants.len(), 2);
    assert_eq!(session.leader().unwrap(), pid(2));
    assert!(session.player(pid(1)).is_err());
    assert_eq!(session.global_stat("doom").unwrap().value, 2);

    first.await.unwrap();
    for handle in [second, third] {
        let events = handle.await.unwrap();
        let crash = events
            .iter()
            .position(|e| *e == SessionEvent::Crash(pid(1)))
            .expect("crash notice");
        let switch = events
            .iter()
            .position(|e| *e == SessionEvent::LeaderSwitch(pid(2)))
            .expect("leader switch");
        assert!(crash < switch);
    }
}

#[tokio::test]
async fn test_stop_handle_cancels_waiting_request() {
    let game = TestGame::new(false, ask_scenes);
    let mut session = session(&game);
    let stop = session.stop_handle();
    let (participants, streams) = connect(&[(1, "ann")]);
    let (asked_tx, asked_rx) = oneshot::channel();
    let client = silent(streams.into_iter().next().unwrap(), asked_tx);

    let running = tokio::spawn(async move {
        let outcome = session.run(participants, RunParameters::new_game()).await;
        (session, outcome)
    });

    asked_rx.await.unwrap();
    stop.stop();
    let (session, outcome) = running.await.unwrap();

    assert!(outcome.result.is_ok(), "{:?}", outcome.result);
    assert_eq!(outcome.participants.len(), 1);
    assert!(stop.is_stopped());
    // The request never resolved, so the stat keeps its rolled value.
    assert_eq!(session.global_stat("doom").unwrap().value, 3);

    let events = client.await.unwrap();
    let tail: Vec<_> = events.iter().rev().take(2).cloned().collect();
    assert_eq!(tail, vec![SessionEvent::Stop, SessionEvent::FinishRequest]);
}

#[tokio::test]
async fn test_kill_last_player_ends_with_no_player_alive() {
    fn scenes(id: SceneId) -> Option<Scene> {
        match id.0 {
            0 => Some(vec![]),
            1 => Some(vec![step(|s| {
                Box::pin(async move {
                    s.kill(pid(1), "fell into the pit").await?;
                    Ok(None)
                })
            })]),
            _ => None,
        }
    }
    let game = TestGame::new(false, scenes);
    let mut session = session(&game);
    let (participants, streams) = connect(&[(1, "ann")]);
    let client = bot(streams.into_iter().next().unwrap(), 0);

    let outcome = session.run(participants, RunParameters::new_game()).await;
    assert!(matches!(outcome.result, Err(SessionError::NoPlayerAlive)));
    assert!(outcome.participants.is_empty());

    let events = client.await.unwrap();
    assert_eq!(
        events.last(),
        Some(&SessionEvent::Die {
            player: pid(1),
            reason: "fell into the pit".into()
        })
    );
}

#[tokio::test]
async fn test_kill_leader_hands_leadership_over() {
    fn scenes(id: SceneId) -> Option<Scene> {
        match id.0 {
            0 => Some(vec![]),
            1 => Some(vec![step(|s| {
                Box::pin(async move {
                    let leader = s.leader()?;
                    s.kill(leader, "poison").await?;
                    Ok(None)
                })
            })]),
            _ => None,
        }
    }
    let game = TestGame::new(false, scenes);
    let mut session = session(&game);
    let (participants, streams) = connect(&[(1, "ann"), (5, "eve")]);
    let bots: Vec<_> = streams.into_iter().map(|s| bot(s, 0)).collect();

    let outcome = session.run(participants, RunParameters::new_game()).await;
    assert!(outcome.result.is_ok(), "{:?}", outcome.result);
    assert_eq!(outcome.participants.len(), 1);
    assert_eq!(outcome.participants[0].id, pid(5));
    assert_eq!(session.leader().unwrap(), pid(5));

    let mut bots = bots.into_iter();
    bots.next().unwrap().await.unwrap();
    let survivor = bots.next().unwrap().await.unwrap();
    assert!(survivor.contains(&SessionEvent::LeaderSwitch(pid(5))));
}

#[tokio::test]
async fn test_unknown_scene_ends_run_with_error() {
    fn scenes(id: SceneId) -> Option<Scene> {
        match id.0 {
            0 => Some(vec![]),
            1 => Some(vec![step(|_| Box::pin(async { Ok(Some(SceneId(99))) }))]),
            _ => None,
        }
    }
    let game = TestGame::new(false, scenes);
    let mut session = session(&game);
    let (participants, streams) = connect(&[(1, "ann")]);
    let _bots: Vec<_> = streams.into_iter().map(|s| bot(s, 0)).collect();

    let outcome = session.run(participants, RunParameters::new_game()).await;
    assert!(matches!(
        outcome.result,
        Err(SessionError::UnknownScene(SceneId(99)))
    ));
    assert_eq!(outcome.participants.len(), 1);
}

#[tokio::test]
async fn test_request_to_absent_player_is_unknown_player() {
    fn scenes(id: SceneId) -> Option<Scene> {
        match id.0 {
            0 => Some(vec![]),
            1 => Some(vec![step(|s| {
                Box::pin(async move {
                    s.ask_confirm(Target::Player(pid(42)), "Ready?").await?;
                    Ok(None)
                })
            })]),
            _ => None,
        }
    }
    let game = TestGame::new(false, scenes);
    let mut session = session(&game);
    let (participants, streams) = connect(&[(1, "ann")]);
    let _bots: Vec<_> = streams.into_iter().map(|s| bot(s, 0)).collect();

    let outcome = session.run(participants, RunParameters::new_game()).await;
    assert!(matches!(
        outcome.result,
        Err(SessionError::UnknownPlayer(id)) if id == pid(42)
    ));
}

#[tokio::test]
async fn test_dice_roll_results_are_shown_and_returned() {
    fn scenes(id: SceneId) -> Option<Scene> {
        match id.0 {
            0 => Some(vec![]),
            1 => Some(vec![step(|s| {
                Box::pin(async move {
                    let rolls = s
                        .ask_dice_roll(Target::All, "Roll!", DiceFormula { dice: 2, bonus: 1 })
                        .await?;
                    let total: i32 = rolls.values().map(|r| r.total()).sum();
                    s.global_stat_mut("doom")?.set(rolls.len() as i32);
                    assert!((6..=26).contains(&total));
                    Ok(None)
                })
            })]),
            _ => None,
        }
    }
    let game = TestGame::new(false, scenes);
    let mut session = session(&game);
    let (participants, streams) = connect(&[(1, "ann"), (2, "bob")]);
    let bots: Vec<_> = streams.into_iter().map(|s| bot(s, 0)).collect();

    let outcome = session.run(participants, RunParameters::new_game()).await;
    assert!(outcome.result.is_ok(), "{:?}", outcome.result);
    assert_eq!(session.global_stat("doom").unwrap().value, 2);

    let events = bots.into_iter().next().unwrap().await.unwrap();
    let shown = events.iter().find_map(|e| match e {
        SessionEvent::Request {
            kind: RequestKind::DiceRoll { results, .. },
            ..
        } => Some(results.clone()),
        _ => None,
    });
    let shown = shown.expect("dice roll request");
    assert_eq!(shown.len(), 2);
    assert!(shown.iter().all(|r| r.dice.len() == 2));
}

#[tokio::test]
async fn test_new_game_prints_rolled_setup() {
    let game = TestGame::configured(empty_scenes, |game| {
        game.global_stats.push((
            "secret".into(),
            StatDescriptor {
                initial: DiceFormula::fixed(1),
                limits: StatLimits { min: 0, max: 5 },
                capped: false,
                hidden: true,
                main: false,
            },
        ));
        game.inventories.push((
            "pack".into(),
            InventoryDescriptor {
                capacity: None,
                initial: BTreeMap::from([("rope".to_string(), 2)]),
            },
        ));
    });
    let mut session = session(&game);
    let (participants, streams) = connect(&[(1, "ann")]);
    let client = bot(streams.into_iter().next().unwrap(), 0);

    let outcome = session.run(participants, RunParameters::new_game()).await;
    assert!(outcome.result.is_ok(), "{:?}", outcome.result);

    let notes: Vec<String> = client
        .await
        .unwrap()
        .into_iter()
        .filter_map(|e| match e {
            SessionEvent::Text {
                style: TextStyle::Note,
                text,
            } => Some(text),
            _ => None,
        })
        .collect();
    assert_eq!(
        notes,
        vec![
            "Global stats:",
            "doom: 3",
            "ann's stats:",
            "hp: 10",
            "ann's inventories:",
            "pack capacity: unlimited",
            "pack holds: rope*2",
        ]
    );
}

// =========================================================================
// Conditions
// =========================================================================

fn fainting(game: &mut GameDescriptor) {
    game.death_conditions.push(DeathCondition {
        die_if: Condition {
            stat: "hp".into(),
            op: Comparison::LessOrEqual,
            value: 0,
        },
        message: "fainted".into(),
    });
}

#[tokio::test]
async fn test_check_player_kills_only_when_condition_met() {
    fn scenes(id: SceneId) -> Option<Scene> {
        match id.0 {
            0 => Some(vec![]),
            1 => Some(vec![step(|s| {
                Box::pin(async move {
                    if let Some(hp) = s.player_mut(pid(1))?.stats.get_mut("hp") {
                        hp.set(0);
                    }
                    let ann_died = s.check_player(pid(1)).await?;
                    let bob_died = s.check_player(pid(2)).await?;
                    s.global_stat_mut("doom")?
                        .set(2 * i32::from(ann_died) + i32::from(bob_died));
                    Ok(None)
                })
            })]),
            _ => None,
        }
    }
    let game = TestGame::configured(scenes, fainting);
    let mut session = session(&game);
    let (participants, streams) = connect(&[(1, "ann"), (2, "bob")]);
    let bots: Vec<_> = streams.into_iter().map(|s| bot(s, 0)).collect();

    let outcome = session.run(participants, RunParameters::new_game()).await;
    assert!(outcome.result.is_ok(), "{:?}", outcome.result);
    assert_eq!(session.global_stat("doom").unwrap().value, 2);
    assert_eq!(outcome.participants.len(), 1);
    assert_eq!(session.leader().unwrap(), pid(2));

    let mut bots = bots.into_iter();
    bots.next().unwrap().await.unwrap();
    let survivor = bots.next().unwrap().await.unwrap();
    assert!(survivor.contains(&SessionEvent::Die {
        player: pid(1),
        reason: "fainted".into()
    }));
    assert!(survivor.contains(&SessionEvent::LeaderSwitch(pid(2))));
}

#[tokio::test]
async fn test_check_player_without_conditions_keeps_everyone() {
    fn scenes(id: SceneId) -> Option<Scene> {
        match id.0 {
            0 => Some(vec![]),
            1 => Some(vec![step(|s| {
                Box::pin(async move {
                    if let Some(hp) = s.player_mut(pid(1))?.stats.get_mut("hp") {
                        hp.set(0);
                    }
                    let died = s.check_player(pid(1)).await?;
                    s.global_stat_mut("doom")?.set(i32::from(died));
                    Ok(None)
                })
            })]),
            _ => None,
        }
    }
    let game = TestGame::new(false, scenes);
    let mut session = session(&game);
    let (participants, streams) = connect(&[(1, "ann")]);
    let _bots: Vec<_> = streams.into_iter().map(|s| bot(s, 0)).collect();

    let outcome = session.run(participants, RunParameters::new_game()).await;
    assert!(outcome.result.is_ok(), "{:?}", outcome.result);
    assert_eq!(session.global_stat("doom").unwrap().value, 0);
    assert_eq!(outcome.participants.len(), 1);
}

#[tokio::test]
async fn test_check_player_on_missing_stat_is_unknown_stat() {
    fn scenes(id: SceneId) -> Option<Scene> {
        match id.0 {
            0 => Some(vec![]),
            1 => Some(vec![step(|s| {
                Box::pin(async move {
                    s.check_player(pid(1)).await?;
                    Ok(None)
                })
            })]),
            _ => None,
        }
    }
    let game = TestGame::configured(scenes, |game| {
        game.death_conditions.push(DeathCondition {
            die_if: Condition {
                stat: "sanity".into(),
                op: Comparison::Less,
                value: 1,
            },
            message: "lost it".into(),
        });
    });
    let mut session = session(&game);
    let (participants, streams) = connect(&[(1, "ann")]);
    let _bots: Vec<_> = streams.into_iter().map(|s| bot(s, 0)).collect();

    let outcome = session.run(participants, RunParameters::new_game()).await;
    assert!(matches!(
        outcome.result,
        Err(SessionError::UnknownStat(name)) if name == "sanity"
    ));
}

#[tokio::test]
async fn test_check_game_end_condition_stops_after_step() {
    fn scenes(id: SceneId) -> Option<Scene> {
        match id.0 {
            0 => Some(vec![]),
            1 => Some(vec![
                step(|s| {
                    Box::pin(async move {
                        // doom starts at 3: the game goes on.
                        if !s.check_game().await? {
                            return Ok(None);
                        }
                        s.global_stat_mut("doom")?.set(6);
                        s.check_game().await?;
                        Ok(Some(SceneId(2)))
                    })
                }),
                step(|s| {
                    Box::pin(async move {
                        s.global_stat_mut("doom")?.set(0);
                        Ok(None)
                    })
                }),
            ]),
            _ => None,
        }
    }
    let game = TestGame::configured(scenes, |game| {
        game.game_end_conditions.push(EndCondition {
            stop_if: Condition {
                stat: "doom".into(),
                op: Comparison::GreaterOrEqual,
                value: 5,
            },
            message: "The sky falls".into(),
        });
    });
    let mut session = session(&game);
    let stop = session.stop_handle();
    let (participants, streams) = connect(&[(1, "ann")]);
    let client = bot(streams.into_iter().next().unwrap(), 0);

    let outcome = session.run(participants, RunParameters::new_game()).await;
    assert!(outcome.result.is_ok(), "{:?}", outcome.result);
    assert!(stop.is_stopped());
    assert_eq!(session.global_stat("doom").unwrap().value, 6);

    let events = client.await.unwrap();
    assert!(events.contains(&SessionEvent::Text {
        style: TextStyle::Important,
        text: "The sky falls".into()
    }));
    // The jump to scene 2 is never taken.
    assert!(!events.contains(&SessionEvent::SceneSwitch(SceneId(2))));
    assert_eq!(events.last(), Some(&SessionEvent::Stop));
}

#[tokio::test]
async fn test_restore_without_saved_leader_votes_when_configured() {
    let game = TestGame::configured(empty_scenes, |game| game.vote_on_leader_death = true);
    game.insert_save("save", saved_state(&[1, 2, 3], 1, 3));
    let mut session = session(&game);
    let (participants, streams) = connect(&[(1, "ann"), (2, "bob")]);
    // Both vote for the second option, "bob".
    let bots: Vec<_> = streams.into_iter().map(|s| bot(s, 1)).collect();
    let params = RunParameters {
        checkpoint: Some("save".into()),
        allow_missing: true,
    };

    let outcome = session.run(participants, params).await;
    assert!(outcome.result.is_ok(), "{:?}", outcome.result);
    assert_eq!(session.leader().unwrap(), pid(2));

    let events = bots.into_iter().next().unwrap().await.unwrap();
    assert!(events.iter().any(|e| matches!(
        e,
        SessionEvent::Request { kind: RequestKind::Options(names), .. } if names == &["ann", "bob"]
    )));
}
