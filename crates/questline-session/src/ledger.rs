//! Game state ledger: stats, inventories, players and their snapshots.
//!
//! This is the narrow slice of game data the session core reads and
//! writes. Everything here is plain data with serde derives so a
//! [`GameBuilder`](crate::GameBuilder) can persist a [`GameState`] in any
//! format it likes.

use std::collections::BTreeMap;

use questline_protocol::{PlayerId, SceneId, SessionEvent, StatValues};
use rand::Rng;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Dice
// ---------------------------------------------------------------------------

/// `dice` six-sided dice plus a flat `bonus`.
///
/// A formula with zero dice is a fixed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiceFormula {
    pub dice: u8,
    pub bonus: i32,
}

impl DiceFormula {
    /// A formula that always yields `value`.
    pub const fn fixed(value: i32) -> Self {
        Self {
            dice: 0,
            bonus: value,
        }
    }

    /// Lowest possible total.
    pub fn min(&self) -> i32 {
        i32::from(self.dice) + self.bonus
    }

    /// Highest possible total.
    pub fn max(&self) -> i32 {
        i32::from(self.dice) * 6 + self.bonus
    }

    /// Rolls every die with the given random source.
    pub fn roll<R: Rng + ?Sized>(&self, rng: &mut R) -> Roll {
        let dice = (0..self.dice).map(|_| rng.random_range(1..=6)).collect();
        Roll {
            dice,
            bonus: self.bonus,
        }
    }
}

/// Result of rolling a [`DiceFormula`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Roll {
    pub dice: Vec<u8>,
    pub bonus: i32,
}

impl Roll {
    pub fn total(&self) -> i32 {
        self.dice.iter().map(|d| i32::from(*d)).sum::<i32>() + self.bonus
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Inclusive bounds for a stat value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatLimits {
    pub min: i32,
    pub max: i32,
}

impl StatLimits {
    /// Brings `value` into the limits. Inverted limits never panic: the
    /// upper bound wins.
    pub fn bound(&self, value: i32) -> i32 {
        value.max(self.min).min(self.max)
    }
}

impl Default for StatLimits {
    fn default() -> Self {
        Self {
            min: i32::MIN,
            max: i32::MAX,
        }
    }
}

/// One named numeric attribute, global or per player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    pub value: i32,
    pub limits: StatLimits,
    pub hidden: bool,
    pub main: bool,
}

impl Stat {
    /// Sets the value, clamped into the limits.
    pub fn set(&mut self, value: i32) {
        self.value = self.limits.bound(value);
    }

    /// Adds `delta` (possibly negative), clamped into the limits.
    pub fn add(&mut self, delta: i32) {
        self.set(self.value.saturating_add(delta));
    }

    /// The wire notice describing this stat. Hidden stats only reveal
    /// their name and flags.
    pub fn to_event(&self, name: &str) -> SessionEvent {
        SessionEvent::GlobalStat {
            name: name.to_string(),
            main: self.main,
            values: (!self.hidden).then_some(StatValues {
                min: self.limits.min,
                max: self.limits.max,
                value: self.value,
            }),
        }
    }
}

/// How a stat is initialized for a new game.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatDescriptor {
    pub initial: DiceFormula,
    pub limits: StatLimits,
    /// The rolled value also becomes the maximum, never below `limits.min`.
    pub capped: bool,
    pub hidden: bool,
    pub main: bool,
}

impl StatDescriptor {
    /// Rolls a fresh stat from this descriptor.
    pub fn instantiate<R: Rng + ?Sized>(&self, rng: &mut R) -> Stat {
        let rolled = self.initial.roll(rng).total();
        let mut limits = self.limits;
        if self.capped {
            limits.max = limits.bound(rolled);
        }
        let mut stat = Stat {
            value: 0,
            limits,
            hidden: self.hidden,
            main: self.main,
        };
        stat.set(rolled);
        stat
    }
}

/// Named stats, ordered by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatsManager(BTreeMap<String, Stat>);

impl StatsManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, stat: Stat) {
        self.0.insert(name.into(), stat);
    }

    pub fn get(&self, name: &str) -> Option<&Stat> {
        self.0.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Stat> {
        self.0.get_mut(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Stat)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Inventories
// ---------------------------------------------------------------------------

/// A bag of items with an optional total capacity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inventory {
    pub capacity: Option<u32>,
    pub items: BTreeMap<String, u32>,
}

impl Inventory {
    /// Total quantity across every item.
    pub fn total(&self) -> u32 {
        self.items.values().sum()
    }

    /// Adds `qty` of `item`. Returns `false`, changing nothing, when that
    /// would exceed the capacity.
    pub fn add(&mut self, item: &str, qty: u32) -> bool {
        if let Some(capacity) = self.capacity {
            if self.total().saturating_add(qty) > capacity {
                return false;
            }
        }
        *self.items.entry(item.to_string()).or_insert(0) += qty;
        true
    }

    /// Removes `qty` of `item`. Returns `false`, changing nothing, when
    /// fewer are held.
    pub fn remove(&mut self, item: &str, qty: u32) -> bool {
        match self.items.get_mut(item) {
            Some(held) if *held >= qty => {
                *held -= qty;
                if *held == 0 {
                    self.items.remove(item);
                }
                true
            }
            _ => false,
        }
    }
}

/// How an inventory is initialized for a new game.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryDescriptor {
    /// Rolled capacity; `None` means unbounded.
    pub capacity: Option<DiceFormula>,
    pub initial: BTreeMap<String, u32>,
}

// ---------------------------------------------------------------------------
// Players
// ---------------------------------------------------------------------------

/// Per-player snapshot stored in checkpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerState {
    pub stats: StatsManager,
    pub inventories: BTreeMap<String, BTreeMap<String, u32>>,
    pub capacities: BTreeMap<String, Option<u32>>,
}

/// A participant's in-game character.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Player {
    pub id: PlayerId,
    pub name: String,
    pub stats: StatsManager,
    pub inventories: BTreeMap<String, Inventory>,
}

impl Player {
    /// Creates a player with fresh stats and inventories.
    pub fn new<R: Rng + ?Sized>(
        id: PlayerId,
        name: &str,
        game: &GameDescriptor,
        rng: &mut R,
    ) -> Self {
        let mut stats = StatsManager::new();
        for (stat_name, descriptor) in &game.player_stats {
            stats.insert(stat_name.clone(), descriptor.instantiate(rng));
        }

        let mut inventories = BTreeMap::new();
        for (inv_name, descriptor) in &game.inventories {
            let capacity = descriptor
                .capacity
                .map(|formula| formula.roll(rng).total().max(0) as u32);
            inventories.insert(
                inv_name.clone(),
                Inventory {
                    capacity,
                    items: descriptor.initial.clone(),
                },
            );
        }

        Self {
            id,
            name: name.to_string(),
            stats,
            inventories,
        }
    }

    /// Rebuilds a player from a checkpoint entry.
    pub fn from_state(id: PlayerId, name: &str, state: PlayerState) -> Self {
        let PlayerState {
            stats,
            mut inventories,
            capacities,
        } = state;
        let mut restored = BTreeMap::new();
        for (inv_name, capacity) in capacities {
            let items = inventories.remove(&inv_name).unwrap_or_default();
            restored.insert(inv_name, Inventory { capacity, items });
        }
        // Contents saved without a capacity entry are unbounded.
        for (inv_name, items) in inventories {
            restored.insert(
                inv_name,
                Inventory {
                    capacity: None,
                    items,
                },
            );
        }
        Self {
            id,
            name: name.to_string(),
            stats,
            inventories: restored,
        }
    }

    /// Snapshot of this player for checkpoints and update diffs.
    pub fn state(&self) -> PlayerState {
        PlayerState {
            stats: self.stats.clone(),
            inventories: self
                .inventories
                .iter()
                .map(|(name, inv)| (name.clone(), inv.items.clone()))
                .collect(),
            capacities: self
                .inventories
                .iter()
                .map(|(name, inv)| (name.clone(), inv.capacity))
                .collect(),
        }
    }
}

/// What changed for one player since the last update sent about them.
///
/// Serialized to JSON for [`SessionEvent::PlayerUpdate`]. Items removed
/// entirely show up with quantity `0`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PlayerDiff {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub stats: BTreeMap<String, Stat>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub items: BTreeMap<String, BTreeMap<String, u32>>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub capacities: BTreeMap<String, Option<u32>>,
}

impl PlayerDiff {
    /// Computes the changes from `before` (or from nothing) to `after`.
    pub fn between(before: Option<&PlayerState>, after: &PlayerState) -> Self {
        let empty = PlayerState::default();
        let before = before.unwrap_or(&empty);
        let mut diff = Self::default();

        for (name, stat) in after.stats.iter() {
            if before.stats.get(name) != Some(stat) {
                diff.stats.insert(name.clone(), *stat);
            }
        }

        for (inv_name, items) in &after.inventories {
            let old = before.inventories.get(inv_name);
            let mut changed = BTreeMap::new();
            for (item, qty) in items {
                if old.and_then(|o| o.get(item)) != Some(qty) {
                    changed.insert(item.clone(), *qty);
                }
            }
            if let Some(old) = old {
                for item in old.keys().filter(|item| !items.contains_key(*item)) {
                    changed.insert(item.clone(), 0);
                }
            }
            if !changed.is_empty() {
                diff.items.insert(inv_name.clone(), changed);
            }
        }

        for (inv_name, capacity) in &after.capacities {
            if before.capacities.get(inv_name) != Some(capacity) {
                diff.capacities.insert(inv_name.clone(), *capacity);
            }
        }

        diff
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty() && self.items.is_empty() && self.capacities.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Game description and checkpoints
// ---------------------------------------------------------------------------

/// Comparison used by a [`Condition`]. Serialized as its operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparison {
    #[serde(rename = "==")]
    Equal,
    #[serde(rename = "!=")]
    NotEqual,
    #[serde(rename = "<")]
    Less,
    #[serde(rename = "<=", alias = "=<")]
    LessOrEqual,
    #[serde(rename = ">")]
    Greater,
    #[serde(rename = ">=", alias = "=>")]
    GreaterOrEqual,
}

impl Comparison {
    pub fn holds(self, lhs: i32, rhs: i32) -> bool {
        match self {
            Self::Equal => lhs == rhs,
            Self::NotEqual => lhs != rhs,
            Self::Less => lhs < rhs,
            Self::LessOrEqual => lhs <= rhs,
            Self::Greater => lhs > rhs,
            Self::GreaterOrEqual => lhs >= rhs,
        }
    }
}

/// `stat <op> value`, tested against a set of stats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub stat: String,
    pub op: Comparison,
    pub value: i32,
}

impl Condition {
    /// `None` when `stats` has no such stat.
    pub fn test(&self, stats: &StatsManager) -> Option<bool> {
        stats
            .get(&self.stat)
            .map(|stat| self.op.holds(stat.value, self.value))
    }
}

/// A player dies as soon as `die_if` holds for their stats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeathCondition {
    pub die_if: Condition,
    pub message: String,
}

/// The game ends as soon as `stop_if` holds for the global stats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndCondition {
    pub stop_if: Condition,
    pub message: String,
}

/// Static description of a game, used to initialize a new one.
///
/// Descriptor lists are ordered: stats are rolled in that order, so a
/// seeded random source always yields the same game.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameDescriptor {
    pub name: String,
    pub global_stats: Vec<(String, StatDescriptor)>,
    pub player_stats: Vec<(String, StatDescriptor)>,
    pub inventories: Vec<(String, InventoryDescriptor)>,
    /// Elect the first leader by vote instead of lowest id.
    pub vote_leader: bool,
    /// Vote again when a restored checkpoint's leader is not connected.
    #[serde(default)]
    pub vote_on_leader_death: bool,
    #[serde(default)]
    pub death_conditions: Vec<DeathCondition>,
    #[serde(default)]
    pub game_end_conditions: Vec<EndCondition>,
}

/// Everything needed to resume a game.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameState {
    pub scene: SceneId,
    pub global: StatsManager,
    pub leader: PlayerId,
    pub players: BTreeMap<PlayerId, PlayerState>,
}
