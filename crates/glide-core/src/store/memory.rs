use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{GramCount, NGramStore, StoreError, WordInfo};
use crate::token::{GramKey, ReservedToken, WordId, USER_ID_BASE};

const MAGIC: &[u8; 4] = b"GLNG";
const VERSION: u8 = 1;

/// HashMap-backed store holding stock counts and learned counts together.
#[derive(Clone, Default)]
pub struct MemoryStore {
    words: HashMap<String, WordInfo>,
    grams: HashMap<GramKey, GramCount>,
    params: HashMap<String, String>,
    next_user_id: i64,
}

/// Flat serialization format for bincode.
#[derive(Serialize, Deserialize)]
struct StoreData {
    words: Vec<(String, WordInfo)>,
    grams: Vec<(GramKey, GramCount)>,
    params: Vec<(String, String)>,
    next_user_id: i64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            next_user_id: USER_ID_BASE,
            ..Self::default()
        }
    }

    /// Register a corpus word with a fixed id below `USER_ID_BASE`.
    pub fn add_stock_word(&mut self, word: &str, id: WordId, cluster: Option<WordId>) {
        debug_assert!(!id.is_reserved() && !id.is_user());
        self.words.insert(word.to_string(), WordInfo { id, cluster });
    }

    /// Add `count` corpus occurrences to `key` and to its denominator row.
    pub fn add_stock(&mut self, key: GramKey, count: u64, cluster: bool) {
        self.grams.entry(key).or_default().stock += count;
        self.grams.entry(key.total(cluster)).or_default().stock += count;
    }

    pub fn gram(&self, key: &GramKey) -> Option<&GramCount> {
        self.grams.get(key)
    }

    pub fn word(&self, word: &str) -> Option<WordInfo> {
        self.words.get(word).copied()
    }

    pub fn gram_count(&self) -> usize {
        self.grams.len()
    }

    /// Serialize to bytes (GLNG format).
    pub fn to_bytes(&self) -> Result<Vec<u8>, StoreError> {
        let data = StoreData {
            words: self.words.iter().map(|(w, i)| (w.clone(), *i)).collect(),
            grams: self.grams.iter().map(|(k, c)| (*k, *c)).collect(),
            params: self
                .params
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            next_user_id: self.next_user_id,
        };
        let body = bincode::serialize(&data).map_err(StoreError::Serialize)?;

        let mut buf = Vec::with_capacity(5 + body.len());
        buf.extend_from_slice(MAGIC);
        buf.push(VERSION);
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    /// Deserialize from bytes (GLNG format).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StoreError> {
        if bytes.len() < 5 {
            return Err(StoreError::InvalidHeader);
        }
        if &bytes[0..4] != MAGIC {
            return Err(StoreError::InvalidMagic);
        }
        if bytes[4] != VERSION {
            return Err(StoreError::UnsupportedVersion(bytes[4]));
        }
        let data: StoreData =
            bincode::deserialize(&bytes[5..]).map_err(StoreError::Deserialize)?;
        Ok(Self {
            words: data.words.into_iter().collect(),
            grams: data.grams.into_iter().collect(),
            params: data.params.into_iter().collect(),
            next_user_id: data.next_user_id.max(USER_ID_BASE),
        })
    }

    /// Atomic write: write to .tmp then rename.
    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        let bytes = self.to_bytes()?;
        let tmp = path.with_extension("tmp");
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Open from file, returning an empty store if the file doesn't exist.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        match fs::read(path) {
            Ok(bytes) => Self::from_bytes(&bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::new()),
            Err(e) => Err(e.into()),
        }
    }
}

impl NGramStore for MemoryStore {
    fn get_words(&self, words: &[String]) -> Result<HashMap<String, WordInfo>, StoreError> {
        let mut found: HashMap<String, WordInfo> = ReservedToken::ALL
            .iter()
            .map(|t| {
                (
                    t.name().to_string(),
                    WordInfo {
                        id: t.id(),
                        cluster: None,
                    },
                )
            })
            .collect();
        for w in words {
            if let Some(info) = self.words.get(w) {
                found.insert(w.clone(), *info);
            }
        }
        Ok(found)
    }

    fn add_word(&mut self, word: &str) -> Result<WordId, StoreError> {
        if let Some(t) = ReservedToken::from_name(word) {
            return Ok(t.id());
        }
        if let Some(info) = self.words.get(word) {
            return Ok(info.id);
        }
        let id = WordId(self.next_user_id);
        self.next_user_id += 1;
        self.words
            .insert(word.to_string(), WordInfo { id, cluster: None });
        debug!(word, id = id.0, "allocated word id");
        Ok(id)
    }

    fn get_grams(&self, keys: &[GramKey]) -> Result<HashMap<GramKey, GramCount>, StoreError> {
        Ok(keys
            .iter()
            .filter_map(|k| self.grams.get(k).map(|c| (*k, *c)))
            .collect())
    }

    fn set_grams(&mut self, rows: &HashMap<GramKey, GramCount>) -> Result<(), StoreError> {
        for (key, row) in rows {
            let entry = self.grams.entry(*key).or_default();
            entry.user = row.user;
            entry.replace = row.replace;
            entry.last_day = row.last_day;
        }
        Ok(())
    }

    fn get_param(&self, name: &str) -> Result<Option<String>, StoreError> {
        Ok(self.params.get(name).cloned())
    }

    fn set_param(&mut self, name: &str, value: &str) -> Result<(), StoreError> {
        self.params.insert(name.to_string(), value.to_string());
        Ok(())
    }

    fn purge(&mut self, min_count: f64, min_day: u32) -> Result<usize, StoreError> {
        let mut purged = 0;
        self.grams.retain(|_, row| {
            let stale = row.last_day != 0
                && row.last_day < min_day
                && row.user + row.replace < min_count;
            if !stale {
                return true;
            }
            purged += 1;
            row.user = 0.0;
            row.replace = 0.0;
            row.last_day = 0;
            row.stock > 0
        });
        debug!(purged, min_count, min_day, "purged learned rows");
        Ok(purged)
    }
}
