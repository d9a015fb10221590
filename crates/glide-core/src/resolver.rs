//! Surface word → (word id, cluster id) resolution with capitalization
//! fallback.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::store::{NGramStore, StoreError, WordInfo};
use crate::token::ReservedToken;

/// Caches exact-case store lookups, including misses.
pub struct WordResolver {
    cache: HashMap<String, Option<WordInfo>>,
    capacity: usize,
}

/// Only the first letter is uppercase and the rest is lowercase letters,
/// e.g. "Table" but not "NASA" or "McDonald".
pub fn is_plausible_common_noun(word: &str) -> bool {
    let mut chars = word.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    let rest: Vec<char> = chars.collect();
    first.is_uppercase() && !rest.is_empty() && rest.iter().all(|c| c.is_lowercase())
}

fn reserved_info(word: &str) -> Option<WordInfo> {
    ReservedToken::from_name(word).map(|t| WordInfo {
        id: t.id(),
        cluster: None,
    })
}

impl WordResolver {
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: HashMap::new(),
            capacity,
        }
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }

    /// Resolve `words`. Words flagged in `lowercase_first` prefer their
    /// lowercase form when it exists and is not itself being resolved.
    /// Unknown words are absent from the result.
    pub fn resolve(
        &mut self,
        store: &dyn NGramStore,
        words: &[String],
        lowercase_first: &HashSet<String>,
    ) -> Result<HashMap<String, WordInfo>, StoreError> {
        self.fetch(store, words)?;

        let requested: HashSet<&str> = words.iter().map(String::as_str).collect();
        let mut resolved = HashMap::with_capacity(words.len());
        for w in words {
            if let Some(info) = reserved_info(w) {
                resolved.insert(w.clone(), info);
                continue;
            }
            let lower = w.to_lowercase();
            let exact = self.cached(w);
            let lowered = if lower != *w { self.cached(&lower) } else { None };

            let info = if lowercase_first.contains(w) && !requested.contains(lower.as_str()) {
                lowered.or(exact)
            } else {
                exact.or(lowered)
            };
            if let Some(info) = info {
                resolved.insert(w.clone(), info);
            }
        }
        Ok(resolved)
    }

    /// Like [`resolve`](Self::resolve), but allocates ids for unknown words.
    /// Sentence-initial words that look like capitalized common nouns are
    /// stored in lowercase.
    pub fn resolve_or_allocate(
        &mut self,
        store: &mut dyn NGramStore,
        words: &[String],
        lowercase_first: &HashSet<String>,
    ) -> Result<HashMap<String, WordInfo>, StoreError> {
        let mut resolved = self.resolve(store, words, lowercase_first)?;
        for w in words {
            if resolved.contains_key(w) {
                continue;
            }
            let form = if lowercase_first.contains(w) && is_plausible_common_noun(w) {
                w.to_lowercase()
            } else {
                w.clone()
            };
            let id = store.add_word(&form)?;
            let info = WordInfo { id, cluster: None };
            debug!(word = %w, stored = %form, id = id.0, "new word");
            self.cache.insert(form, Some(info));
            resolved.insert(w.clone(), info);
        }
        Ok(resolved)
    }

    fn cached(&self, word: &str) -> Option<WordInfo> {
        self.cache.get(word).copied().flatten()
    }

    /// One batched store call for every form not cached yet.
    fn fetch(&mut self, store: &dyn NGramStore, words: &[String]) -> Result<(), StoreError> {
        let mut forms: Vec<String> = Vec::new();
        let mut seen = HashSet::new();
        for w in words {
            if ReservedToken::from_name(w).is_some() {
                continue;
            }
            for form in [w.clone(), w.to_lowercase()] {
                if seen.insert(form.clone()) {
                    forms.push(form);
                }
            }
        }
        let mut missing: Vec<String> = forms
            .iter()
            .filter(|f| !self.cache.contains_key(*f))
            .cloned()
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        if self.cache.len() + missing.len() > self.capacity {
            self.cache.clear();
            missing = forms;
        }
        let found = store.get_words(&missing)?;
        for form in missing {
            let info = found.get(&form).copied();
            self.cache.insert(form, info);
        }
        Ok(())
    }
}
