//! "The Lantern Road": a short built-in story.
//!
//! ```text
//! 0 intro ──▶ 1 crossroads ──vote──▶ 2 forest ──▶ 4 gate
//!                          └───────▶ 3 river  ──▶ 4 gate
//! ```

use std::collections::BTreeMap;

use questline_protocol::{PlayerId, SceneId, Target, TextStyle, YES};
use questline_session::{
    CheckpointError, Comparison, Condition, DeathCondition, DiceFormula, GameBuilder,
    GameDescriptor, GameState, InventoryDescriptor, ReplyPolicy, Scene, SceneProvider, Session,
    SessionError, StatDescriptor, StatLimits, step,
};

use crate::store::JsonStore;

const CROSSROADS: SceneId = SceneId(1);
const FOREST: SceneId = SceneId(2);
const RIVER: SceneId = SceneId(3);
const GATE: SceneId = SceneId(4);

/// Footing rolls below this cost health.
const FOOTING: i32 = 5;

pub struct Lantern {
    game: GameDescriptor,
    store: JsonStore,
}

impl Lantern {
    pub fn new(store: JsonStore) -> Self {
        Self {
            game: descriptor(),
            store,
        }
    }
}

fn descriptor() -> GameDescriptor {
    let stat = |initial, max, capped, hidden| StatDescriptor {
        initial,
        limits: StatLimits { min: 0, max },
        capped,
        hidden,
        main: !hidden,
    };
    GameDescriptor {
        name: "The Lantern Road".into(),
        global_stats: vec![(
            "oil".into(),
            stat(DiceFormula { dice: 2, bonus: 4 }, 20, false, false),
        )],
        player_stats: vec![
            (
                "hp".into(),
                stat(DiceFormula { dice: 1, bonus: 6 }, 12, true, false),
            ),
            ("luck".into(), stat(DiceFormula::fixed(3), 6, false, true)),
        ],
        inventories: vec![(
            "pack".into(),
            InventoryDescriptor {
                capacity: Some(DiceFormula::fixed(6)),
                initial: BTreeMap::from([("matches".to_string(), 3)]),
            },
        )],
        vote_leader: true,
        vote_on_leader_death: true,
        death_conditions: vec![DeathCondition {
            die_if: Condition {
                stat: "hp".into(),
                op: Comparison::LessOrEqual,
                value: 0,
            },
            message: "The road claims another traveller.".into(),
        }],
        game_end_conditions: Vec::new(),
    }
}

impl SceneProvider for Lantern {
    fn scene(&self, id: SceneId) -> Result<Scene, SessionError> {
        let scene = match id.0 {
            0 => intro(),
            1 => crossroads(),
            2 => forest(),
            3 => river(),
            4 => gate(),
            _ => return Err(SessionError::UnknownScene(id)),
        };
        Ok(scene)
    }
}

impl GameBuilder for Lantern {
    fn game(&self) -> &GameDescriptor {
        &self.game
    }

    fn load(&self, name: &str) -> Result<GameState, CheckpointError> {
        self.store.load(name)
    }

    fn save(&self, name: &str, state: &GameState) -> Result<String, CheckpointError> {
        self.store.save(name, state)
    }
}

// ---------------------------------------------------------------------------
// Scenes
// ---------------------------------------------------------------------------

fn intro() -> Scene {
    vec![step(|s| {
        Box::pin(async move {
            s.print(TextStyle::Title, "The Lantern Road").await?;
            s.print(
                TextStyle::Normal,
                "Night falls over the valley. One lantern, a little oil, and a long way home.",
            )
            .await?;
            Ok(None)
        })
    })]
}

fn crossroads() -> Scene {
    vec![
        step(|s| {
            Box::pin(async move {
                s.print(TextStyle::Normal, "The road splits at an old milestone.")
                    .await?;
                Ok(None)
            })
        }),
        step(|s| {
            Box::pin(async move {
                let choice = s
                    .vote("Which way?", &["Through the forest", "Along the river"])
                    .await?;
                Ok(Some(if choice == 0 { FOREST } else { RIVER }))
            })
        }),
    ]
}

fn forest() -> Scene {
    vec![
        step(|s| {
            Box::pin(async move {
                s.print(TextStyle::Normal, "Roots and stones hide under the leaves.")
                    .await?;
                let rolls = s
                    .ask_dice_roll(
                        Target::All,
                        "Roll for your footing",
                        DiceFormula { dice: 2, bonus: 0 },
                    )
                    .await?;
                for (id, roll) in rolls {
                    if roll.total() < FOOTING {
                        hurt(s, id, 3, "lost in the dark woods").await?;
                    }
                }
                Ok(None)
            })
        }),
        step(|s| {
            Box::pin(async move {
                s.global_stat_mut("oil")?.add(-2);
                s.send_global_stat("oil").await?;
                Ok(None)
            })
        }),
        step(|s| {
            Box::pin(async move {
                let leader = s.leader()?;
                let replies = s
                    .ask_yes_no(
                        Target::Player(leader),
                        "A dry hollow. Rest here and save your progress?",
                        ReplyPolicy::first(),
                    )
                    .await?;
                if replies.get(&leader) == Some(&YES) {
                    let stored = s.checkpoint("forest")?;
                    s.print(TextStyle::Note, &format!("Progress saved as {stored:?}."))
                        .await?;
                }
                Ok(Some(GATE))
            })
        }),
    ]
}

fn river() -> Scene {
    vec![
        step(|s| {
            Box::pin(async move {
                let leader = s.leader()?;
                let offer = s
                    .ask_range(
                        Target::Player(leader),
                        "The ferryman wants matches. How many do you offer?",
                        0,
                        3,
                        ReplyPolicy::first(),
                    )
                    .await?
                    .get(&leader)
                    .copied()
                    .unwrap_or(0);

                let paid = {
                    let pack = s
                        .player_mut(leader)?
                        .inventories
                        .get_mut("pack")
                        .ok_or_else(|| SessionError::UnknownInventory("pack".into()))?;
                    offer > 0 && pack.remove("matches", u32::from(offer))
                };
                s.send_player_update(leader).await?;

                if paid {
                    s.print(TextStyle::Normal, "The ferryman nods and trims your lantern.")
                        .await?;
                    s.global_stat_mut("oil")?.add(i32::from(offer));
                    s.send_global_stat("oil").await?;
                } else {
                    s.print(TextStyle::Important, "You wade across the cold water.")
                        .await?;
                    for id in s.participant_ids() {
                        hurt(s, id, 2, "swept away by the river").await?;
                    }
                }
                Ok(None)
            })
        }),
        step(|s| {
            Box::pin(async move {
                let replies = s
                    .ask_options(
                        Target::All,
                        "On the far bank:",
                        &["Press on", "Look back"],
                        ReplyPolicy::first_then_wait(),
                    )
                    .await?;
                if replies.values().next() == Some(&1) {
                    s.print(TextStyle::Note, "The lights of the ferry fade behind you.")
                        .await?;
                }
                Ok(Some(GATE))
            })
        }),
    ]
}

fn gate() -> Scene {
    vec![
        step(|s| {
            Box::pin(async move {
                s.print(TextStyle::Title, "The Gate").await?;
                s.battle_init(r#"[{"name":"Gatekeeper","hp":8}]"#).await?;
                for id in s.participant_ids() {
                    let damage = s.roll(DiceFormula { dice: 1, bonus: 1 }).total();
                    s.battle_attack(id, "Gatekeeper", damage).await?;
                }
                s.battle_end().await?;
                Ok(None)
            })
        }),
        step(|s| {
            Box::pin(async move {
                let oil = s.global_stat("oil")?.value;
                let ending = if oil > 0 {
                    "The lantern still burns as the gate swings open. You are home."
                } else {
                    "The lantern gutters out, but the gate is warm to the touch. You are home."
                };
                s.print(TextStyle::Important, ending).await?;
                s.ask_confirm(Target::All, "The end.").await?;
                Ok(None)
            })
        }),
    ]
}

/// Takes `amount` health from a player, tells them why, and lets the
/// death conditions decide whether they survive.
async fn hurt(
    s: &mut Session,
    id: PlayerId,
    amount: i32,
    reason: &str,
) -> Result<(), SessionError> {
    s.player_mut(id)?
        .stats
        .get_mut("hp")
        .ok_or_else(|| SessionError::UnknownStat("hp".into()))?
        .add(-amount);
    s.send_player_update(id).await?;
    s.print_to(id, TextStyle::Important, reason).await?;
    s.check_player(id).await?;
    Ok(())
}
