//! N-gram evidence for a batch of candidates.
//!
//! For every candidate the word-level orders `s1..s3` and, when the word has
//! a cluster, the cluster-level orders `c1..c3` are fetched in a single
//! batched store call and turned into stock probabilities plus raw user
//! statistics. Normalization across candidates happens in [`crate::filter`].

use std::collections::{HashMap, HashSet};

use tracing::{debug, debug_span};

use crate::context::Context;
use crate::resolver::WordResolver;
use crate::store::{GramCount, NGramStore, StoreError, WordInfo};
use crate::token::{GramKey, ReservedToken, WordId, MAX_ORDER};

/// Learned statistics of one row, as of the last write.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct UserStats {
    pub count: f64,
    pub replace: f64,
    /// Matching `#TOTAL` row user count, never below `count`.
    pub total: f64,
    pub age_days: u32,
}

impl UserStats {
    fn from_rows(row: &GramCount, total: &GramCount, today: u32) -> Self {
        let mut denom = total.user.max(row.user);
        // A word replaced in a brand-new context still needs a denominator.
        if denom <= 0.0 && row.replace > 0.0 {
            denom = 1.0;
        }
        Self {
            count: row.user,
            replace: row.replace,
            total: denom,
            age_days: row.age_days(today),
        }
    }

    pub fn is_active(&self) -> bool {
        self.count > 0.0 || self.replace > 0.0
    }

    pub fn net(&self) -> f64 {
        self.count - self.replace
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct OrderStats {
    pub stock: u64,
    pub stock_total: u64,
    /// `stock / stock_total`, times `coef_wc` for cluster orders.
    pub stock_prob: f64,
    pub user: UserStats,
}

/// Evidence for one candidate. Index `i` of `words`/`clusters` is order `i + 1`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScoreDetail {
    /// `None` for words the store does not know.
    pub word_id: Option<WordId>,
    pub cluster_id: Option<WordId>,
    pub words: [Option<OrderStats>; MAX_ORDER],
    pub clusters: [Option<OrderStats>; MAX_ORDER],
    /// P(word | cluster) from the 1-gram rows.
    pub coef_wc: Option<f64>,
}

impl ScoreDetail {
    pub fn word(&self, order: usize) -> Option<&OrderStats> {
        self.words.get(order - 1).and_then(Option::as_ref)
    }

    pub fn cluster(&self, order: usize) -> Option<&OrderStats> {
        self.clusters.get(order - 1).and_then(Option::as_ref)
    }
}

/// Cache key: word id plus the two context ids (`#NA`-padded).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct DetailKey {
    word: WordId,
    context: [WordId; 2],
}

struct Pending {
    surface: String,
    key: DetailKey,
    info: WordInfo,
}

pub struct Aggregator {
    cache: HashMap<DetailKey, ScoreDetail>,
    capacity: usize,
    /// Day the cached details were aged to.
    day: u32,
}

impl Aggregator {
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: HashMap::new(),
            capacity,
            day: 0,
        }
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    /// Score `words` after `context`. Words flagged in `lowercase_first` are
    /// resolved through their lowercase form when possible.
    pub fn score_candidates(
        &mut self,
        store: &dyn NGramStore,
        resolver: &mut WordResolver,
        words: &[String],
        context: &Context,
        lowercase_first: &HashSet<String>,
        today: u32,
    ) -> Result<HashMap<String, ScoreDetail>, StoreError> {
        let _span = debug_span!("score_candidates", candidates = words.len()).entered();
        if today != self.day {
            self.cache.clear();
            self.day = today;
        }

        let ctx_words = context.words();
        let mut flagged = lowercase_first.clone();
        for (i, w) in ctx_words.iter().enumerate() {
            let next_is_start = ctx_words
                .get(i + 1)
                .is_some_and(|n| ReservedToken::from_name(n) == Some(ReservedToken::Start));
            if next_is_start {
                flagged.insert(w.clone());
            }
        }
        let mut lookup: Vec<String> = words.to_vec();
        lookup.extend(ctx_words.iter().cloned());
        let resolved = resolver.resolve(store, &lookup, &flagged)?;

        let na = ReservedToken::NotAvailable.id();
        let mut ctx_ids = [na; 2];
        let mut ctx_clusters = [na; 2];
        for (i, w) in ctx_words.iter().take(2).enumerate() {
            if let Some(info) = resolved.get(w) {
                ctx_ids[i] = info.id;
                ctx_clusters[i] = info.cluster.unwrap_or(info.id);
            }
        }

        let mut out = HashMap::with_capacity(words.len());
        let mut pending: Vec<Pending> = Vec::new();
        let mut keys: Vec<GramKey> = Vec::new();
        let mut seen: HashSet<GramKey> = HashSet::new();
        let mut want = |k: GramKey, keys: &mut Vec<GramKey>| {
            if seen.insert(k) {
                keys.push(k);
            }
        };

        for w in words {
            let Some(info) = resolved.get(w).copied() else {
                out.insert(w.clone(), ScoreDetail::default());
                continue;
            };
            let key = DetailKey {
                word: info.id,
                context: ctx_ids,
            };
            if let Some(hit) = self.cache.get(&key) {
                out.insert(w.clone(), hit.clone());
                continue;
            }
            for order in 1..=MAX_ORDER {
                let k = GramKey::new(info.id, &ctx_ids, order);
                want(k, &mut keys);
                want(k.total(false), &mut keys);
                if let Some(cluster) = info.cluster {
                    let ck = GramKey::new(cluster, &ctx_clusters, order);
                    want(ck, &mut keys);
                    want(ck.total(true), &mut keys);
                }
            }
            pending.push(Pending {
                surface: w.clone(),
                key,
                info,
            });
        }

        if pending.is_empty() {
            return Ok(out);
        }
        let rows = store.get_grams(&keys)?;
        debug!(keys = keys.len(), rows = rows.len(), "fetched grams");

        if self.cache.len() + pending.len() > self.capacity {
            self.cache.clear();
        }
        for p in pending {
            let detail = build_detail(&rows, p.info, &ctx_ids, &ctx_clusters, today);
            self.cache.insert(p.key, detail.clone());
            out.insert(p.surface, detail);
        }
        Ok(out)
    }
}

fn order_stats(
    rows: &HashMap<GramKey, GramCount>,
    key: GramKey,
    cluster: bool,
    today: u32,
) -> OrderStats {
    let empty = GramCount::default();
    let row = rows.get(&key).unwrap_or(&empty);
    let total = rows.get(&key.total(cluster)).unwrap_or(&empty);
    let stock_prob = if total.stock > 0 {
        row.stock as f64 / total.stock as f64
    } else {
        0.0
    };
    OrderStats {
        stock: row.stock,
        stock_total: total.stock,
        stock_prob,
        user: UserStats::from_rows(row, total, today),
    }
}

fn build_detail(
    rows: &HashMap<GramKey, GramCount>,
    info: WordInfo,
    ctx_ids: &[WordId; 2],
    ctx_clusters: &[WordId; 2],
    today: u32,
) -> ScoreDetail {
    let mut detail = ScoreDetail {
        word_id: Some(info.id),
        cluster_id: info.cluster,
        ..ScoreDetail::default()
    };
    for order in 1..=MAX_ORDER {
        let k = GramKey::new(info.id, ctx_ids, order);
        detail.words[order - 1] = Some(order_stats(rows, k, false, today));
    }

    let Some(cluster) = info.cluster else {
        return detail;
    };
    let word_unigram = detail.words[0].map_or(0, |s| s.stock);
    let cluster_unigram = rows
        .get(&GramKey::new(cluster, &[], 1))
        .map_or(0, |r| r.stock);
    if cluster_unigram == 0 {
        return detail;
    }
    let coef_wc = word_unigram as f64 / cluster_unigram as f64;
    detail.coef_wc = Some(coef_wc);
    for order in 1..=MAX_ORDER {
        let k = GramKey::new(cluster, ctx_clusters, order);
        let mut stats = order_stats(rows, k, true, today);
        stats.stock_prob *= coef_wc;
        detail.clusters[order - 1] = Some(stats);
    }
    detail
}
