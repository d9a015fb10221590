//! Deferred learning from accepted and rejected words.
//!
//! `learn` only records intent. Events become n-gram updates at `commit`,
//! once they are old enough that the user is unlikely to take them back.

use std::collections::{HashMap, HashSet};

use time::{Duration, OffsetDateTime};
use tracing::{debug, debug_span};

use crate::context::{Context, CONTEXT_LEN};
use crate::resolver::WordResolver;
use crate::settings::LearnSettings;
use crate::store::{GramCount, NGramStore, StoreError};
use crate::token::{GramKey, ReservedToken, WordId, MAX_ORDER};

/// A word together with the context it was typed in.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LearnKey {
    pub word: String,
    /// Nearest first, at most two words.
    pub context: Vec<String>,
}

impl LearnKey {
    pub fn new(word: &str, context: &Context) -> Self {
        Self {
            word: word.to_string(),
            context: context.words().iter().take(CONTEXT_LEN).cloned().collect(),
        }
    }

    fn sentence_initial(&self) -> bool {
        self.context
            .first()
            .is_some_and(|w| ReservedToken::from_name(w) == Some(ReservedToken::Start))
    }
}

/// Net pending change for one key. Events on the same key accumulate until
/// commit, so a removal of an already committed word is never lost.
#[derive(Clone, Debug, PartialEq)]
pub struct LearnEvent {
    pub key: LearnKey,
    /// Occurrence delta, one of -1, 0 or 1.
    pub occurrence: i8,
    /// The word was offered here and the user picked another one.
    pub replaced: bool,
    /// Time of the last change; the commit delay restarts from here.
    pub created: OffsetDateTime,
}

impl LearnEvent {
    fn is_noop(&self) -> bool {
        self.occurrence == 0 && !self.replaced
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CommitReport {
    pub events: usize,
    pub rows: usize,
    pub remaining: usize,
}

#[derive(Debug, Default)]
pub struct LearnQueue {
    pending: HashMap<LearnKey, LearnEvent>,
}

impl LearnQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn pending(&self, key: &LearnKey) -> Option<&LearnEvent> {
        self.pending.get(key)
    }

    /// Record that `word` was typed (`add`) or withdrawn after `context`.
    /// With `replaces`, the replaced word is recorded as rejected here.
    ///
    /// An add cancels a pending removal and a removal cancels a pending add.
    /// A pending replacement is only settled by commit.
    pub fn learn(
        &mut self,
        add: bool,
        word: &str,
        context: &Context,
        replaces: Option<&str>,
        now: OffsetDateTime,
    ) {
        let step = if add { 1 } else { -1 };
        self.update(LearnKey::new(word, context), now, |e| {
            e.occurrence = (e.occurrence + step).clamp(-1, 1);
        });

        if let Some(old) = replaces.filter(|old| *old != word) {
            self.update(LearnKey::new(old, context), now, |e| e.replaced = true);
        }
    }

    fn update(&mut self, key: LearnKey, now: OffsetDateTime, apply: impl FnOnce(&mut LearnEvent)) {
        let event = self.pending.entry(key.clone()).or_insert_with(|| LearnEvent {
            key: key.clone(),
            occurrence: 0,
            replaced: false,
            created: now,
        });
        apply(event);
        event.created = now;
        debug!(
            word = %key.word,
            occurrence = event.occurrence,
            replaced = event.replaced,
            "learn"
        );
        if event.is_noop() {
            debug!(word = %key.word, "pending events cancel out");
            self.pending.remove(&key);
        }
    }

    /// Write due events (all of them when `force`) to `store` with one read
    /// and one write.
    pub fn commit(
        &mut self,
        store: &mut dyn NGramStore,
        resolver: &mut WordResolver,
        settings: &LearnSettings,
        force: bool,
        now: OffsetDateTime,
        today: u32,
    ) -> Result<CommitReport, StoreError> {
        let _span = debug_span!("commit", pending = self.pending.len(), force).entered();
        let delay = Duration::seconds(settings.commit_delay_secs as i64);
        let due: Vec<LearnKey> = self
            .pending
            .values()
            .filter(|e| force || now - e.created >= delay)
            .map(|e| e.key.clone())
            .collect();
        if due.is_empty() {
            return Ok(CommitReport {
                remaining: self.pending.len(),
                ..CommitReport::default()
            });
        }

        let events: Vec<&LearnEvent> = due.iter().filter_map(|k| self.pending.get(k)).collect();
        let updates = plan_updates(store, resolver, &events)?;

        let keys: Vec<GramKey> = updates.iter().map(|u| u.key).collect();
        let mut rows = store.get_grams(&keys)?;
        for row in rows.values_mut() {
            row.age_to(today, settings.half_life_days);
        }
        for u in &updates {
            let row = rows.entry(u.key).or_insert_with(|| GramCount {
                last_day: today,
                ..GramCount::default()
            });
            row.age_to(today, settings.half_life_days);
            row.user = (row.user + u.user).max(0.0);
            row.replace = (row.replace + u.replace).max(0.0);
        }
        store.set_grams(&rows)?;

        for k in &due {
            self.pending.remove(k);
        }
        let report = CommitReport {
            events: due.len(),
            rows: rows.len(),
            remaining: self.pending.len(),
        };
        debug!(
            events = report.events,
            rows = report.rows,
            remaining = report.remaining,
            "committed"
        );
        Ok(report)
    }
}

/// A delta to apply to one row.
#[derive(Clone, Copy, Debug, PartialEq)]
struct RowUpdate {
    key: GramKey,
    user: f64,
    replace: f64,
}

/// Resolve every word of `events` in one batch and derive the row deltas.
fn plan_updates(
    store: &mut dyn NGramStore,
    resolver: &mut WordResolver,
    events: &[&LearnEvent],
) -> Result<Vec<RowUpdate>, StoreError> {
    let mut words: Vec<String> = vec![
        ReservedToken::Start.name().to_string(),
        ReservedToken::NotAvailable.name().to_string(),
    ];
    let mut seen: HashSet<String> = words.iter().cloned().collect();
    let mut heads: HashSet<String> = HashSet::new();
    let mut flagged: HashSet<String> = HashSet::new();
    for e in events {
        if e.key.sentence_initial() {
            flagged.insert(e.key.word.clone());
        }
        if e.key.context.len() == CONTEXT_LEN
            && ReservedToken::from_name(&e.key.context[1]) == Some(ReservedToken::Start)
        {
            flagged.insert(e.key.context[0].clone());
        }
        heads.insert(e.key.word.clone());
        for w in std::iter::once(&e.key.word).chain(&e.key.context) {
            if seen.insert(w.clone()) {
                words.push(w.clone());
            }
        }
    }

    let mut resolved = resolver.resolve(store, &words, &flagged)?;
    let unknown: Vec<String> = words
        .iter()
        .filter(|w| heads.contains(*w) && !resolved.contains_key(*w))
        .cloned()
        .collect();
    if !unknown.is_empty() {
        resolved.extend(resolver.resolve_or_allocate(store, &unknown, &flagged)?);
    }

    let na = ReservedToken::NotAvailable.id();
    let mut updates = Vec::new();
    for e in events {
        let Some(head) = resolved.get(&e.key.word).map(|i| i.id) else {
            continue;
        };
        let context: Vec<WordId> = e
            .key
            .context
            .iter()
            .map_while(|w| resolved.get(w).map(|i| i.id).filter(|id| *id != na))
            .collect();
        let max_order = (1 + context.len()).min(MAX_ORDER);
        let user = f64::from(e.occurrence);
        let replace = if e.replaced { 1.0 } else { 0.0 };
        for order in (1..=max_order).rev() {
            let key = GramKey::new(head, &context, order);
            updates.push(RowUpdate { key, user, replace });
            if order >= 2 && user != 0.0 {
                updates.push(RowUpdate {
                    key: key.total(false),
                    user,
                    replace: 0.0,
                });
            }
        }
    }
    Ok(updates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Settings;
    use crate::store::MemoryStore;

    const CAT: WordId = WordId(3);

    fn store() -> MemoryStore {
        let mut s = MemoryStore::new();
        s.add_stock_word("the", WordId(1), None);
        s.add_stock_word("cat", CAT, None);
        s
    }

    fn at(secs: i64) -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(secs)
    }

    fn settings() -> LearnSettings {
        Settings::default().learn
    }

    fn user(s: &MemoryStore, key: GramKey) -> f64 {
        s.gram(&key).map_or(0.0, |r| r.user)
    }

    #[test]
    fn occurrence_counts_each_order_once() {
        let mut s = store();
        let mut r = WordResolver::new(100);
        let mut q = LearnQueue::new();
        let start = ReservedToken::Start.id();
        q.learn(true, "cat", &Context::start(), None, at(0));
        let report = q
            .commit(&mut s, &mut r, &settings(), true, at(1), 100)
            .unwrap();
        assert_eq!(report.events, 1);
        assert_eq!(report.remaining, 0);
        assert_eq!(user(&s, GramKey::new(CAT, &[], 1)), 1.0);
        assert_eq!(user(&s, GramKey::new(CAT, &[start], 2)), 1.0);
        // The context ends after #START, so no trigram.
        assert!(s.gram(&GramKey::new(CAT, &[start], 3)).is_none());
        // Only orders above 1 touch the denominator.
        assert_eq!(user(&s, GramKey::new(CAT, &[start], 2).total(false)), 1.0);
        assert!(s.gram(&GramKey::new(CAT, &[], 1).total(false)).is_none());
    }

    #[test]
    fn commit_waits_for_delay_unless_forced() {
        let mut s = store();
        let mut r = WordResolver::new(100);
        let mut q = LearnQueue::new();
        q.learn(true, "cat", &Context::start(), None, at(0));
        let report = q.commit(&mut s, &mut r, &settings(), false, at(5), 100).unwrap();
        assert_eq!(report.events, 0);
        assert_eq!(report.remaining, 1);
        let report = q.commit(&mut s, &mut r, &settings(), false, at(20), 100).unwrap();
        assert_eq!(report.events, 1);
        assert!(q.is_empty());
    }

    #[test]
    fn removal_drops_pending_occurrence() {
        let mut q = LearnQueue::new();
        let ctx = Context::new(["the"]);
        q.learn(true, "cat", &ctx, None, at(0));
        q.learn(false, "cat", &ctx, None, at(1));
        assert!(q.is_empty());
    }

    #[test]
    fn replacement_survives_removal() {
        let mut q = LearnQueue::new();
        let ctx = Context::new(["over", "go"]);
        q.learn(true, "their", &ctx, Some("there"), at(0));
        q.learn(false, "there", &ctx, None, at(1));
        let e = q.pending(&LearnKey::new("there", &ctx)).unwrap();
        assert!(e.replaced);
        assert_eq!(e.occurrence, -1);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn removal_before_replacement_is_kept() {
        let mut q = LearnQueue::new();
        let ctx = Context::new(["over", "go"]);
        q.learn(false, "there", &ctx, None, at(0));
        q.learn(true, "their", &ctx, Some("there"), at(1));
        let e = q.pending(&LearnKey::new("there", &ctx)).unwrap();
        assert!(e.replaced);
        assert_eq!(e.occurrence, -1);
    }

    #[test]
    fn add_restarts_delay_and_keeps_replacement() {
        let mut q = LearnQueue::new();
        let ctx = Context::new(["over", "go"]);
        q.learn(true, "their", &ctx, Some("there"), at(0));
        q.learn(true, "there", &ctx, None, at(5));
        q.learn(true, "there", &ctx, None, at(6));
        let e = q.pending(&LearnKey::new("there", &ctx)).unwrap();
        assert_eq!(e.occurrence, 1);
        assert!(e.replaced);
        assert_eq!(e.created, at(6));
    }

    #[test]
    fn removal_then_add_cancels() {
        let mut s = store();
        let mut r = WordResolver::new(100);
        let mut q = LearnQueue::new();
        let ctx = Context::new(["the"]);
        q.learn(true, "cat", &ctx, None, at(0));
        q.commit(&mut s, &mut r, &settings(), true, at(1), 100).unwrap();
        q.learn(false, "cat", &ctx, None, at(2));
        q.learn(true, "cat", &ctx, None, at(3));
        assert!(q.is_empty());
        q.commit(&mut s, &mut r, &settings(), true, at(4), 100).unwrap();
        assert_eq!(user(&s, GramKey::new(CAT, &[WordId(1)], 2)), 1.0);
    }

    #[test]
    fn replacement_leaves_denominator_alone() {
        let mut s = store();
        let mut r = WordResolver::new(100);
        let mut q = LearnQueue::new();
        let ctx = Context::new(["the"]);
        q.learn(true, "dog", &ctx, Some("cat"), at(0));
        q.commit(&mut s, &mut r, &settings(), true, at(1), 100).unwrap();
        let key = GramKey::new(CAT, &[WordId(1)], 2);
        let row = s.gram(&key).unwrap();
        assert_eq!(row.replace, 1.0);
        assert_eq!(row.user, 0.0);
        // Only the "dog" occurrence reached the total.
        assert_eq!(user(&s, key.total(false)), 1.0);
    }

    #[test]
    fn unresolved_context_truncates() {
        let mut s = store();
        let mut r = WordResolver::new(100);
        let mut q = LearnQueue::new();
        q.learn(true, "cat", &Context::new(["the", "#NA"]), None, at(0));
        q.commit(&mut s, &mut r, &settings(), true, at(1), 100).unwrap();
        assert_eq!(user(&s, GramKey::new(CAT, &[WordId(1)], 2)), 1.0);
        let na = ReservedToken::NotAvailable.id();
        assert!(s.gram(&GramKey::new(CAT, &[WordId(1), na], 3)).is_none());
    }

    #[test]
    fn new_words_are_allocated_lowercase_at_sentence_start() {
        let mut s = store();
        let mut r = WordResolver::new(100);
        let mut q = LearnQueue::new();
        q.learn(true, "Zebra", &Context::start(), None, at(0));
        q.commit(&mut s, &mut r, &settings(), true, at(1), 100).unwrap();
        let info = s.word("zebra").unwrap();
        assert!(info.id.is_user());
        assert_eq!(user(&s, GramKey::new(info.id, &[], 1)), 1.0);
    }

    #[test]
    fn same_day_touches_do_not_decay() {
        let mut s = store();
        let mut r = WordResolver::new(100);
        let mut q = LearnQueue::new();
        let key = GramKey::new(CAT, &[], 1);
        for _ in 0..3 {
            q.learn(true, "cat", &Context::default(), None, at(0));
            q.commit(&mut s, &mut r, &settings(), true, at(1), 100).unwrap();
        }
        assert_eq!(user(&s, key), 3.0);
        assert_eq!(s.gram(&key).unwrap().last_day, 100);
    }

    #[test]
    fn decay_is_path_independent() {
        let half_life = settings().half_life_days;
        let mut stepped = GramCount {
            user: 8.0,
            last_day: 100,
            ..GramCount::default()
        };
        let mut direct = stepped;
        stepped.age_to(110, half_life);
        stepped.age_to(110, half_life);
        stepped.age_to(130, half_life);
        direct.age_to(130, half_life);
        assert!((stepped.user - direct.user).abs() < 1e-9);
        assert_eq!(stepped.last_day, 130);
    }

    #[test]
    fn removal_of_committed_word_decrements() {
        let mut s = store();
        let mut r = WordResolver::new(100);
        let mut q = LearnQueue::new();
        let ctx = Context::new(["the"]);
        q.learn(true, "cat", &ctx, None, at(0));
        q.commit(&mut s, &mut r, &settings(), true, at(1), 100).unwrap();
        q.learn(false, "cat", &ctx, None, at(2));
        q.commit(&mut s, &mut r, &settings(), true, at(3), 100).unwrap();
        let key = GramKey::new(CAT, &[WordId(1)], 2);
        assert_eq!(user(&s, key), 0.0);
        assert_eq!(user(&s, key.total(false)), 0.0);
    }
}
