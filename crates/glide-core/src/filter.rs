//! Turns per-candidate n-gram evidence into bounded predict scores.
//!
//! The most specific order with enough data across the candidate set is
//! chosen as the primary score id, stock and user probabilities are compared
//! against the best candidate on a log scale, and the ratio is squashed by a
//! cosine response so extreme ratios for rare words stay bounded.

use std::collections::HashMap;
use std::f64::consts::PI;
use std::fmt;

use tracing::{debug, debug_span};

use crate::aggregate::{OrderStats, ScoreDetail};
use crate::settings::FilterSettings;
use crate::store::decay;
use crate::token::MAX_ORDER;

/// `x` used when a term is zero, well past the saturation point.
const X_SENTINEL: f64 = 10.0;

/// Response curve saturates at this log10 ratio.
const X_SATURATION: f64 = 4.0;

/// An n-gram order at word or cluster level.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ScoreId {
    pub order: usize,
    pub cluster: bool,
}

impl ScoreId {
    /// Specificity rank: s3 > c3 > s2 > c2 > s1 > c1. No evidence ranks 0.
    pub fn class(&self) -> u8 {
        (self.order * 2) as u8 - u8::from(self.cluster)
    }

    fn stats<'a>(&self, detail: &'a ScoreDetail) -> Option<&'a OrderStats> {
        if self.cluster {
            detail.cluster(self.order)
        } else {
            detail.word(self.order)
        }
    }
}

impl fmt::Display for ScoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = if self.cluster { 'c' } else { 's' };
        write!(f, "{prefix}{}", self.order)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FilteredScore {
    pub score: f64,
    pub stock_term: f64,
    pub user_term: f64,
    /// Multiplier applied to `stock_term` for words the user rejected here.
    pub rejection: f64,
    pub x: f64,
}

impl fmt::Display for FilteredScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "predict={:.3} stock={:.3e} user={:.3e} reject={:.3} x={:.2}",
            self.score, self.stock_term, self.user_term, self.rejection, self.x
        )
    }
}

#[derive(Clone, Debug, Default)]
pub struct FilterOutcome {
    pub primary: Option<ScoreId>,
    /// Runner-up score id. Kept for bookkeeping; it does not affect scores.
    pub secondary: Option<ScoreId>,
    pub scores: HashMap<String, FilteredScore>,
}

impl FilterOutcome {
    pub fn class(&self) -> u8 {
        self.primary.map_or(0, |id| id.class())
    }
}

/// Bounded response: 0 at `x = 0`, rising smoothly to 1 at saturation.
pub fn response(x: f64) -> f64 {
    let x = x.clamp(0.0, X_SATURATION);
    (1.0 - (PI * x / X_SATURATION).cos()) / 2.0
}

fn log_ratio(max: f64, term: f64) -> f64 {
    if term > 0.0 && max > 0.0 {
        (max / term).log10()
    } else {
        X_SENTINEL
    }
}

/// Most specific order whose count over surviving candidates exceeds `min`.
fn pick_order(totals: &[u64; MAX_ORDER], min: u64, cluster: bool) -> Option<ScoreId> {
    (1..=MAX_ORDER)
        .rev()
        .find(|&order| totals[order - 1] > min)
        .map(|order| ScoreId { order, cluster })
}

struct UserTerm {
    term: f64,
    rejection: f64,
}

/// Walk orders from the most specific down to the first one with user
/// activity.
fn user_term(detail: &ScoreDetail, max_order: usize, s: &FilterSettings, half_life: f64) -> UserTerm {
    let mut out = UserTerm {
        term: 0.0,
        rejection: 1.0,
    };
    for order in (1..=max_order).rev() {
        let Some(stats) = detail.word(order) else {
            continue;
        };
        let user = stats.user;
        if !user.is_active() {
            continue;
        }
        let skipped = (max_order - order) as i32;
        let age = decay(user.age_days, half_life);
        let net = user.net();
        if net > 0.0 {
            let base = net / user.total;
            let required = s.user_min_samples * s.ramp_ratio.powi(skipped);
            let ramp = (user.total * age / required).min(1.0);
            out.term = base * ramp * age;
        } else if net < 0.0 {
            out.rejection = (-s.reject_coef * -net * age).exp();
        }
        break;
    }
    out
}

/// Score every candidate in `details`.
///
/// `curve` holds the curve score of each candidate; `max_order` is the
/// highest order the context supports (1 + usable context words).
pub fn filter(
    details: &HashMap<String, ScoreDetail>,
    curve: &HashMap<String, f64>,
    max_order: usize,
    s: &FilterSettings,
    half_life_days: f64,
) -> FilterOutcome {
    let _span = debug_span!("filter", candidates = details.len(), max_order).entered();
    let max_order = max_order.clamp(1, MAX_ORDER);

    let curve_of = |w: &str| curve.get(w).copied().unwrap_or(0.0);
    let best_curve = details
        .keys()
        .map(|w| curve_of(w))
        .fold(f64::NEG_INFINITY, f64::max);
    let s1_prob = |d: &ScoreDetail| d.word(1).map_or(0.0, |st| st.stock_prob);
    let best_s1 = details.values().map(s1_prob).fold(0.0, f64::max);

    let mut word_totals = [0u64; MAX_ORDER];
    let mut cluster_totals = [0u64; MAX_ORDER];
    for (w, d) in details {
        let plausible = curve_of(w) >= best_curve - s.curve_gap
            && s1_prob(d) >= best_s1 * s.implausible_ratio;
        if !plausible {
            continue;
        }
        for order in 1..=max_order {
            word_totals[order - 1] += d.word(order).map_or(0, |st| st.stock);
            cluster_totals[order - 1] += d.cluster(order).map_or(0, |st| st.stock);
        }
    }

    let word_id = pick_order(&word_totals, s.min_count, false);
    let cluster_id = pick_order(&cluster_totals, s.cluster_min_count, true);
    let (primary, secondary) = match (word_id, cluster_id) {
        (Some(w), Some(c)) if c.class() > w.class() => (Some(c), Some(w)),
        (Some(w), c) => (Some(w), c),
        (None, c) => (c, None),
    };
    debug!(
        primary = primary.map(|p| p.to_string()),
        secondary = secondary.map(|p| p.to_string()),
        "score ids"
    );

    let mut terms: Vec<(&String, f64, UserTerm)> = Vec::with_capacity(details.len());
    for (w, d) in details {
        let stock = primary
            .and_then(|id| id.stats(d))
            .map_or(0.0, |st| st.stock_prob);
        let user = user_term(d, max_order, s, half_life_days);
        terms.push((w, stock * user.rejection, user));
    }

    let max_stock = terms.iter().map(|t| t.1).fold(0.0, f64::max);
    let max_user = terms.iter().map(|t| t.2.term).fold(0.0, f64::max);

    let scores = terms
        .into_iter()
        .map(|(w, stock_term, user)| {
            let x = log_ratio(max_stock, stock_term).min(log_ratio(max_user, user.term));
            let score = s.max_weight - s.coef * response(x);
            (
                w.clone(),
                FilteredScore {
                    score,
                    stock_term,
                    user_term: user.term,
                    rejection: user.rejection,
                    x,
                },
            )
        })
        .collect();

    FilterOutcome {
        primary,
        secondary,
        scores,
    }
}
