//! Storage contract for word ids and n-gram counts.
//!
//! The persistent store is an external collaborator; `NGramStore` is the
//! functional contract the engine needs from it. `MemoryStore` is a complete
//! in-process implementation used by tests, benches and hosts that keep the
//! model in memory.

mod memory;

pub use memory::MemoryStore;

use std::collections::HashMap;
use std::io;

use serde::{Deserialize, Serialize};

use crate::token::{GramKey, WordId};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid header (too short)")]
    InvalidHeader,

    #[error("invalid magic bytes (expected GLNG)")]
    InvalidMagic,

    #[error("unsupported version: {0}")]
    UnsupportedVersion(u8),

    #[error("serialization error: {0}")]
    Serialize(bincode::Error),

    #[error("deserialization error: {0}")]
    Deserialize(bincode::Error),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Resolved identity of a surface word.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WordInfo {
    pub id: WordId,
    pub cluster: Option<WordId>,
}

/// One n-gram row.
///
/// A row nobody has learned from has zero user counts and `last_day == 0`;
/// once learning touched it, `last_day` is the day of the last update.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GramCount {
    pub stock: u64,
    pub user: f64,
    pub replace: f64,
    pub last_day: u32,
}

impl GramCount {
    /// Decay user counts to `today`. Rows are aged only the first time they
    /// are touched on a later day, so repeated same-day updates never age.
    pub fn age_to(&mut self, today: u32, half_life_days: f64) {
        if self.last_day != 0 && today > self.last_day {
            let factor = decay(today - self.last_day, half_life_days);
            self.user *= factor;
            self.replace *= factor;
        }
        if today > self.last_day {
            self.last_day = today;
        }
    }

    /// Days since the last update, 0 for untouched rows.
    pub fn age_days(&self, today: u32) -> u32 {
        if self.last_day == 0 {
            0
        } else {
            today.saturating_sub(self.last_day)
        }
    }
}

/// Exponential age weighting shared by learning and scoring.
pub fn decay(days: u32, half_life_days: f64) -> f64 {
    (-0.7 * days as f64 / half_life_days).exp()
}

pub trait NGramStore: Send {
    /// Exact-case lookup. Reserved tokens are always part of the result.
    fn get_words(&self, words: &[String]) -> Result<HashMap<String, WordInfo>, StoreError>;

    /// Allocate an id for a new word (ascending, above `USER_ID_BASE`).
    /// Idempotent for a word that already exists with the same case.
    fn add_word(&mut self, word: &str) -> Result<WordId, StoreError>;

    /// Bulk fetch. Keys with no data at all are omitted.
    fn get_grams(&self, keys: &[GramKey]) -> Result<HashMap<GramKey, GramCount>, StoreError>;

    /// Bulk upsert of user counts. The stock count of each row is ignored.
    fn set_grams(&mut self, rows: &HashMap<GramKey, GramCount>) -> Result<(), StoreError>;

    fn get_param(&self, name: &str) -> Result<Option<String>, StoreError>;

    fn set_param(&mut self, name: &str, value: &str) -> Result<(), StoreError>;

    /// Forget learned rows with less than `min_count` user activity that were
    /// last updated before `min_day`. Returns the number of rows purged.
    fn purge(&mut self, min_count: f64, min_day: u32) -> Result<usize, StoreError>;
}
