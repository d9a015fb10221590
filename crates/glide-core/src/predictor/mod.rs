//! Guess orchestration: ranks curve candidates with the language model and
//! owns every piece of per-language state (store, caches, history, learning
//! queue, quality histograms).


use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use time::OffsetDateTime;
use tracing::{debug, debug_span, warn};

use crate::aggregate::Aggregator;
use crate::backtrack::{self, Backtrack, Rescored};
use crate::context::Context;
use crate::error::PredictError;
use crate::filter::{filter, FilterOutcome};
use crate::history::{GuessHistory, GuessRecord, WordCandidateScore};
use crate::learn::LearnQueue;
use crate::quality::QualityHistograms;
use crate::resolver::WordResolver;
use crate::settings::{self, Settings};
use crate::store::NGramStore;
use crate::token::{ReservedToken, MAX_ORDER};

/// Store param holding the day of the last purge.
const LAST_PURGE_PARAM: &str = "state.last_purge_day";

/// How the host will capitalize the word when it is inserted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Capitalization {
    #[default]
    Lower,
    Initial,
    Upper,
}

/// One candidate from the curve recognizer.
#[derive(Clone, Debug, PartialEq)]
pub struct Candidate {
    pub word: String,
    pub curve_score: f64,
    pub capitalization: Capitalization,
    /// Priority suggestion from the recognizer.
    pub star: bool,
}

impl Candidate {
    pub fn new(word: impl Into<String>, curve_score: f64) -> Self {
        Self {
            word: word.into(),
            curve_score,
            capitalization: Capitalization::Lower,
            star: false,
        }
    }

    pub fn starred(mut self) -> Self {
        self.star = true;
        self
    }

    pub fn with_capitalization(mut self, capitalization: Capitalization) -> Self {
        self.capitalization = capitalization;
        self
    }

    fn is_capitalized(&self) -> bool {
        self.capitalization != Capitalization::Lower
            || self.word.chars().next().is_some_and(char::is_uppercase)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RankedWord {
    pub word: String,
    pub score: f64,
    pub curve_score: f64,
    pub predict_score: f64,
    pub class: u8,
}

/// Local calendar day, as stored in `GramCount::last_day`.
pub fn day_number(now: OffsetDateTime) -> u32 {
    now.date().to_julian_day().max(1) as u32
}

fn local_now() -> OffsetDateTime {
    OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc())
}

pub struct Predictor {
    settings: Settings,
    store: Option<Box<dyn NGramStore>>,
    resolver: WordResolver,
    aggregator: Aggregator,
    quality: QualityHistograms,
    history: GuessHistory,
    queue: LearnQueue,
    next_id: u64,
}

impl Predictor {
    /// Build a predictor over `store`, overlaying `host_toml` and the store's
    /// own `section.key` params on the built-in defaults.
    pub fn new(
        store: Option<Box<dyn NGramStore>>,
        host_toml: Option<&str>,
    ) -> Result<Self, PredictError> {
        let mut params = HashMap::new();
        if let Some(store) = store.as_deref() {
            for name in settings::param_names() {
                if let Some(value) = store.get_param(&name)? {
                    params.insert(name, value);
                }
            }
        }
        let settings = Settings::layered(host_toml, &params)?;
        debug!(overrides = params.len(), has_store = store.is_some(), "predictor ready");
        Ok(Self::with_settings(store, settings))
    }

    /// Build a predictor with an already-merged configuration.
    pub fn with_settings(store: Option<Box<dyn NGramStore>>, settings: Settings) -> Self {
        let cache = settings.guess.cache_size;
        Self {
            resolver: WordResolver::new(cache),
            aggregator: Aggregator::new(cache),
            quality: QualityHistograms::new(&settings.quality, None),
            history: GuessHistory::new(settings.guess.history_size),
            queue: LearnQueue::new(),
            next_id: 1,
            store,
            settings,
        }
    }

    /// Persist quality histograms at `path` (loaded lazily on first guess).
    pub fn with_quality_file(mut self, path: PathBuf) -> Self {
        self.quality = QualityHistograms::new(&self.settings.quality, Some(path));
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn history(&self) -> &GuessHistory {
        &self.history
    }

    pub fn store(&self) -> Option<&dyn NGramStore> {
        self.store.as_deref()
    }

    pub fn pending_learn(&self) -> usize {
        self.queue.len()
    }

    pub fn guess(
        &mut self,
        candidates: &[Candidate],
        context: &Context,
        speed: Option<f64>,
    ) -> Vec<RankedWord> {
        self.guess_at(candidates, context, speed, local_now())
    }

    /// Rank `candidates` after `context`. `speed` is the typing speed of the
    /// swipe, when the host knows it.
    pub fn guess_at(
        &mut self,
        candidates: &[Candidate],
        context: &Context,
        speed: Option<f64>,
        now: OffsetDateTime,
    ) -> Vec<RankedWord> {
        let _span = debug_span!("guess", candidates = candidates.len()).entered();

        let mut unique: Vec<&Candidate> = Vec::with_capacity(candidates.len());
        let mut index: HashMap<&str, usize> = HashMap::new();
        for c in candidates {
            match index.get(c.word.as_str()) {
                Some(&i) if unique[i].curve_score >= c.curve_score => {}
                Some(&i) => unique[i] = c,
                None => {
                    index.insert(c.word.as_str(), unique.len());
                    unique.push(c);
                }
            }
        }
        if unique.is_empty() {
            return Vec::new();
        }

        let max_curve = unique
            .iter()
            .map(|c| c.curve_score)
            .fold(f64::NEG_INFINITY, f64::max);
        let qi = self.quality.quality_index(speed, max_curve);
        let g = &self.settings.guess;
        let predict_weight = g.coef_low * (1.0 - qi) + g.coef_high * qi;
        let sentence_start = context.is_sentence_start();
        let curve_scale = if max_curve > 0.0 {
            max_curve.powf(g.curve_pow)
        } else {
            1.0
        };

        let mut scores: HashMap<String, WordCandidateScore> = HashMap::with_capacity(unique.len());
        for c in &unique {
            let mut s = WordCandidateScore::new(c.curve_score, c.capitalization, c.star);
            s.nonpredict = c.curve_score * curve_scale;
            if !sentence_start && c.is_capitalized() {
                s.nonpredict -= g.capital_penalty;
            }
            s.predict_weight = predict_weight;
            s.quality_index = qi;
            scores.insert(c.word.clone(), s);
        }

        let kept = self.truncate(&unique, sentence_start);
        let curve: HashMap<String, f64> = kept
            .iter()
            .map(|c| (c.word.clone(), c.curve_score))
            .collect();
        let words: Vec<String> = kept.iter().map(|c| c.word.clone()).collect();
        let outcome = self.score_language(&words, &curve, context, sentence_start, now);

        let tracing_on = tracing::enabled!(tracing::Level::DEBUG);
        for w in &words {
            let Some(s) = scores.get_mut(w) else {
                continue;
            };
            let filtered = outcome.as_ref().and_then(|o| o.scores.get(w).copied());
            s.predict = filtered.map_or(0.0, |f| f.score);
            s.class = outcome.as_ref().map_or(0, FilterOutcome::class);
            s.final_score = Some(s.nonpredict + predict_weight * s.predict);
            if tracing_on {
                s.trace = Some(match filtered {
                    Some(f) => format!("curve={:.3} qi={qi:.2} {f} class={}", s.curve, s.class),
                    None => format!("curve={:.3} qi={qi:.2} curve-only", s.curve),
                });
            }
        }

        let mut ranked: Vec<String> = unique.iter().map(|c| c.word.clone()).collect();
        ranked.sort_by(|a, b| {
            let (sa, sb) = (&scores[a], &scores[b]);
            sb.score()
                .total_cmp(&sa.score())
                .then_with(|| sb.curve.total_cmp(&sa.curve))
                .then_with(|| a.cmp(b))
        });

        let result: Vec<RankedWord> = ranked
            .iter()
            .map(|w| {
                let s = &scores[w];
                RankedWord {
                    word: w.clone(),
                    score: s.score(),
                    curve_score: s.curve,
                    predict_score: s.predict,
                    class: s.class,
                }
            })
            .collect();

        let id = self.next_id;
        self.next_id += 1;
        debug!(
            id,
            chosen = %ranked[0],
            qi,
            predict_weight,
            "ranked"
        );
        self.history.push(GuessRecord {
            id,
            timestamp: now,
            context: context.clone(),
            chosen: ranked[0].clone(),
            scores,
            ranked,
        });
        result
    }

    /// Candidates that go through the language model. The rest keep their
    /// curve-only score.
    fn truncate<'a>(&mut self, unique: &[&'a Candidate], sentence_start: bool) -> Vec<&'a Candidate> {
        let g = &self.settings.guess;
        let starred = unique.iter().filter(|c| c.star).count();
        let mut unsupported: HashSet<String> = HashSet::new();
        if starred > g.no_new_word_threshold {
            if let Some(store) = self.store.as_deref() {
                let words: Vec<String> = unique.iter().map(|c| c.word.clone()).collect();
                let flagged = sentence_flags(&words, sentence_start);
                match self.resolver.resolve(store, &words, &flagged) {
                    Ok(known) => {
                        unsupported = words.into_iter().filter(|w| !known.contains_key(w)).collect();
                    }
                    Err(e) => warn!("word lookup failed: {e}"),
                }
                debug!(starred, unsupported = unsupported.len(), "star bonus guard");
            }
        }

        let bonus = |c: &Candidate| {
            if c.star && !unsupported.contains(&c.word) {
                g.star_bonus
            } else {
                0.0
            }
        };
        let mut kept: Vec<&Candidate> = unique.to_vec();
        kept.sort_by(|a, b| {
            (b.curve_score + bonus(b))
                .total_cmp(&(a.curve_score + bonus(a)))
                .then_with(|| a.word.cmp(&b.word))
        });
        kept.truncate(g.max_candidates);
        kept
    }

    /// Language-model scores for `words`, or `None` for curve-only ranking.
    fn score_language(
        &mut self,
        words: &[String],
        curve: &HashMap<String, f64>,
        context: &Context,
        sentence_start: bool,
        now: OffsetDateTime,
    ) -> Option<FilterOutcome> {
        let Some(store) = self.store.as_deref() else {
            debug!("no store, curve-only ranking");
            return None;
        };
        let flagged = sentence_flags(words, sentence_start);
        let details = match self.aggregator.score_candidates(
            store,
            &mut self.resolver,
            words,
            context,
            &flagged,
            day_number(now),
        ) {
            Ok(d) => d,
            Err(e) => {
                warn!("scoring failed, curve-only ranking: {e}");
                return None;
            }
        };
        let max_order = (1 + context.usable_len()).min(MAX_ORDER);
        Some(filter(
            &details,
            curve,
            max_order,
            &self.settings.filter,
            self.settings.learn.half_life_days,
        ))
    }

    pub fn learn(&mut self, add: bool, word: &str, context: &Context, replaces: Option<&str>) {
        self.learn_at(add, word, context, replaces, local_now());
    }

    /// Record that `word` was accepted (`add`) or withdrawn after `context`.
    /// Nothing reaches the store before [`commit`](Self::commit).
    pub fn learn_at(
        &mut self,
        add: bool,
        word: &str,
        context: &Context,
        replaces: Option<&str>,
        now: OffsetDateTime,
    ) {
        self.queue.learn(add, word, context, replaces, now);
    }

    pub fn commit(&mut self, force: bool) -> Result<bool, PredictError> {
        self.commit_at(force, local_now())
    }

    /// Write due learning events. Returns `true` while events remain pending.
    pub fn commit_at(&mut self, force: bool, now: OffsetDateTime) -> Result<bool, PredictError> {
        let Some(store) = self.store.as_deref_mut() else {
            if !self.queue.is_empty() {
                debug!(dropped = self.queue.len(), "no store, learning discarded");
                self.queue = LearnQueue::new();
            }
            return Ok(false);
        };
        let report = self.queue.commit(
            store,
            &mut self.resolver,
            &self.settings.learn,
            force,
            now,
            day_number(now),
        )?;
        if report.events > 0 {
            self.aggregator.clear();
        }
        Ok(report.remaining > 0)
    }

    pub fn cleanup(&mut self) -> Result<bool, PredictError> {
        self.cleanup_at(local_now())
    }

    /// Idle tick: commit due events, drop caches, persist quality data and
    /// purge old learned rows when due. Returns `true` if another tick is
    /// needed.
    pub fn cleanup_at(&mut self, now: OffsetDateTime) -> Result<bool, PredictError> {
        let pending = self.commit_at(false, now)?;
        self.aggregator.clear();
        self.resolver.clear();
        self.quality.recompute();
        if let Err(e) = self.quality.save_if_dirty() {
            warn!("saving quality histograms failed: {e}");
        }
        self.purge_if_due(day_number(now))?;
        Ok(pending)
    }

    fn purge_if_due(&mut self, today: u32) -> Result<(), PredictError> {
        let Some(store) = self.store.as_deref_mut() else {
            return Ok(());
        };
        let s = &self.settings.learn;
        let last = store
            .get_param(LAST_PURGE_PARAM)?
            .and_then(|v| v.parse::<u32>().ok());
        if last.is_some_and(|day| today.saturating_sub(day) < s.purge_interval_days) {
            return Ok(());
        }
        let min_day = today.saturating_sub(s.purge_max_age_days);
        let purged = store.purge(s.purge_min_count, min_day)?;
        store.set_param(LAST_PURGE_PARAM, &today.to_string())?;
        debug!(purged, min_day, "purge");
        Ok(())
    }

    pub fn replace_word(&mut self, old: &str, new: &str) -> Result<(), PredictError> {
        self.replace_word_at(old, new, local_now())
    }

    /// The user picked `new` instead of `old` for the most recent guess.
    ///
    /// Learns the correction and nudges the predict weight toward a value
    /// that would have ranked `new` first.
    pub fn replace_word_at(
        &mut self,
        old: &str,
        new: &str,
        now: OffsetDateTime,
    ) -> Result<(), PredictError> {
        let Some(record) = self.history.get_mut(0) else {
            debug!(old, new, "replace without a guess");
            return Ok(());
        };
        let context = record.context.clone();
        let scores = match (record.scores.get(old), record.scores.get(new)) {
            (Some(o), Some(n)) => Some((o.clone(), n.clone())),
            _ => None,
        };
        record.chosen = new.to_string();
        self.queue.learn(true, new, &context, Some(old), now);

        if let Some((o, n)) = scores {
            self.tune_weight(&o, &n)?;
        }
        Ok(())
    }

    fn tune_weight(
        &mut self,
        old: &WordCandidateScore,
        new: &WordCandidateScore,
    ) -> Result<(), PredictError> {
        let dp = new.predict - old.predict;
        if dp == 0.0 {
            return Ok(());
        }
        let t = &self.settings.tuning;
        // Weight at which both words would score the same. No positive
        // weight changes the order when it is not positive itself.
        let even = (old.nonpredict - new.nonpredict) / dp;
        if even <= 0.0 {
            return Ok(());
        }
        let target = even.clamp(t.coef_min, t.coef_max);
        let current = new.predict_weight;
        let wrong_side = if dp > 0.0 {
            current <= target
        } else {
            current >= target
        };
        if !wrong_side {
            return Ok(());
        }

        let delta = t.tune_rate * (target - current);
        let qi = new.quality_index;
        let g = &mut self.settings.guess;
        g.coef_low = (g.coef_low + delta * (1.0 - qi)).clamp(t.coef_min, t.coef_max);
        g.coef_high = (g.coef_high + delta * qi).clamp(t.coef_min, t.coef_max);
        debug!(
            coef_low = g.coef_low,
            coef_high = g.coef_high,
            target,
            "tuned predict weight"
        );
        let (low, high) = (g.coef_low, g.coef_high);
        if let Some(store) = self.store.as_deref_mut() {
            store.set_param("guess.coef_low", &format!("{low:?}"))?;
            store.set_param("guess.coef_high", &format!("{high:?}"))?;
        }
        Ok(())
    }

    pub fn backtrack(&mut self) -> Result<Option<Backtrack>, PredictError> {
        self.backtrack_at(local_now())
    }

    /// Revise the previous word if the most recent guess makes another pair
    /// clearly more likely.
    pub fn backtrack_at(&mut self, now: OffsetDateTime) -> Result<Option<Backtrack>, PredictError> {
        let (Some(g0), Some(g1)) = (self.history.get(0).cloned(), self.history.get(1).cloned()) else {
            return Ok(None);
        };
        if !backtrack::chains(&g1, &g0) {
            debug!("history does not chain");
            return Ok(None);
        }
        if self.store.is_none() {
            return Ok(None);
        }

        let kept: Vec<String> = g0
            .ranked
            .iter()
            .filter(|w| g0.scores.get(*w).is_some_and(|s| s.final_score.is_some()))
            .cloned()
            .collect();
        let curve: HashMap<String, f64> = kept
            .iter()
            .map(|w| (w.clone(), g0.scores[w].curve))
            .collect();
        let settings = self.settings.backtrack.clone();
        let choice = backtrack::best_pair(&g1, &g0, &settings, |ctx| {
            let outcome = self.score_language(&kept, &curve, ctx, false, now)?;
            let class = outcome.class();
            Some(
                outcome
                    .scores
                    .into_iter()
                    .map(|(w, f)| (w, Rescored { predict: f.score, class }))
                    .collect(),
            )
        })?;
        let Some(choice) = choice else {
            return Ok(None);
        };

        let (old1, old0) = (g1.chosen.clone(), g0.chosen.clone());
        let new_ctx0 = g1.context.push_front(&choice.word1);
        self.queue.learn(false, &old1, &g1.context, None, now);
        self.queue.learn(false, &old0, &g0.context, None, now);
        let replaces1 = (choice.word1 != old1).then_some(old1.as_str());
        self.queue.learn(true, &choice.word1, &g1.context, replaces1, now);
        let replaces0 = (choice.word1 == old1).then_some(old0.as_str());
        self.queue.learn(true, &choice.word0, &new_ctx0, replaces0, now);

        if let Some(r1) = self.history.find_mut(g1.id) {
            r1.chosen = choice.word1.clone();
        }
        if let Some(r0) = self.history.find_mut(g0.id) {
            r0.context = new_ctx0;
            r0.chosen = choice.word0.clone();
            for (w, r) in &choice.rescored {
                if let Some(s) = r0.scores.get_mut(w) {
                    s.predict = r.predict;
                    s.class = r.class;
                    s.final_score = Some(s.nonpredict + s.predict_weight * r.predict);
                }
            }
            let scores = &r0.scores;
            r0.ranked.sort_by(|a, b| {
                scores[b]
                    .score()
                    .total_cmp(&scores[a].score())
                    .then_with(|| a.cmp(b))
            });
        }

        debug!(
            old1 = %old1,
            old0 = %old0,
            new1 = %choice.word1,
            new0 = %choice.word0,
            "backtrack accepted"
        );
        Ok(Some(Backtrack {
            anchor: g1
                .context
                .words()
                .first()
                .filter(|w| ReservedToken::from_name(w).is_none())
                .cloned(),
            sentence_start: g1.context.is_sentence_start(),
            new_word1: choice.word1,
            new_word0: choice.word0,
            old_word1: old1,
            old_word0: old0,
            correlation_id: g0.id,
        }))
    }
}

/// At sentence start, candidates resolve through their lowercase form first.
fn sentence_flags(words: &[String], sentence_start: bool) -> HashSet<String> {
    if sentence_start {
        words.iter().cloned().collect()
    } else {
        HashSet::new()
    }
}
