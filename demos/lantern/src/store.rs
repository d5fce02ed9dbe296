//! Checkpoints kept in a single JSON file.
//!
//! The file maps checkpoint names to saved games. It is read on every
//! load and rewritten on every save, which is plenty for a handful of
//! parties.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use questline_session::{CheckpointError, GameState};
use rand::Rng;
use rand::rngs::StdRng;

pub struct JsonStore {
    path: PathBuf,
    /// Picks suffixes for names already taken. Also serializes writers.
    rng: Mutex<StdRng>,
}

impl JsonStore {
    pub fn new(path: impl Into<PathBuf>, rng: StdRng) -> Self {
        Self {
            path: path.into(),
            rng: Mutex::new(rng),
        }
    }

    pub fn load(&self, name: &str) -> Result<GameState, CheckpointError> {
        self.read()?
            .remove(name)
            .ok_or_else(|| CheckpointError::NotFound(name.to_string()))
    }

    /// Saves under `name`, or under `name_N` with a random `N` when that
    /// name is taken. Returns the name actually used.
    pub fn save(&self, name: &str, state: &GameState) -> Result<String, CheckpointError> {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        let mut saves = self.read()?;

        let mut stored = name.to_string();
        while saves.contains_key(&stored) {
            stored = format!("{name}_{}", rng.random_range(1..10_000u32));
        }
        saves.insert(stored.clone(), state.clone());

        std::fs::write(&self.path, serde_json::to_string_pretty(&saves)?)?;
        tracing::debug!(path = %self.path.display(), checkpoint = %stored, "checkpoint file written");
        Ok(stored)
    }

    fn read(&self) -> Result<BTreeMap<String, GameState>, CheckpointError> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) if text.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }
}
