//! Retroactive correction of the previous word.
//!
//! Once the next word has been ranked, every alternative of the previous
//! guess is tried as context for the new one. A different pair wins only if
//! it is clearly better overall, does not lose much language-model support on
//! either word, and is backed by evidence at least as specific as any other
//! pair.

use std::collections::HashMap;

use tracing::{debug, debug_span};

use crate::context::Context;
use crate::error::PredictError;
use crate::history::GuessRecord;
use crate::settings::BacktrackSettings;

/// A correction for the host to apply as a text edit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Backtrack {
    pub new_word1: String,
    pub new_word0: String,
    /// Word before the corrected pair, if any.
    pub anchor: Option<String>,
    pub old_word1: String,
    pub old_word0: String,
    /// Id of the most recent guess.
    pub correlation_id: u64,
    pub sentence_start: bool,
}

/// Predict score and evidence class of a candidate under a new context.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Rescored {
    pub predict: f64,
    pub class: u8,
}

/// The winning pair and the rescoring of `guess0` that produced it.
#[derive(Clone, Debug, PartialEq)]
pub struct PairChoice {
    pub word1: String,
    pub word0: String,
    pub score: f64,
    pub original: f64,
    pub rescored: HashMap<String, Rescored>,
}

/// Check that `guess0` directly follows `guess1` in the same sentence.
pub fn chains(guess1: &GuessRecord, guess0: &GuessRecord) -> bool {
    !guess0.context.is_sentence_start()
        && guess0
            .context
            .matches(&guess1.context.push_front(&guess1.chosen))
}

fn invariant(record: &GuessRecord) -> PredictError {
    PredictError::Invariant(format!(
        "guess {} chose '{}' which it never scored",
        record.id, record.chosen
    ))
}

/// Look for a better `(word1, word0)` pair than the one chosen.
///
/// `rescore` ranks `guess0`'s candidates after a different previous word.
/// Returns `Ok(None)` when the original pair stands.
pub fn best_pair<F>(
    guess1: &GuessRecord,
    guess0: &GuessRecord,
    settings: &BacktrackSettings,
    mut rescore: F,
) -> Result<Option<PairChoice>, PredictError>
where
    F: FnMut(&Context) -> Option<HashMap<String, Rescored>>,
{
    let _span = debug_span!("backtrack", guess = guess0.id).entered();
    let orig1 = guess1.chosen_score().ok_or_else(|| invariant(guess1))?;
    let orig0 = guess0.chosen_score().ok_or_else(|| invariant(guess0))?;

    let pair_score = |np1: f64, pw1: f64, p1: f64, np0: f64, pw0: f64, p0: f64| {
        np1 + np0 + (pw1 + pw0) / 2.0 * (p1 + p0)
    };
    let original = pair_score(
        orig1.nonpredict,
        orig1.predict_weight,
        orig1.predict,
        orig0.nonpredict,
        orig0.predict_weight,
        orig0.predict,
    );

    struct Pair<'a> {
        word1: &'a str,
        word0: &'a str,
        score: f64,
        class: u8,
        predict1: f64,
        predict0: f64,
    }
    let mut pairs: Vec<Pair> = Vec::new();
    let mut rescorings: HashMap<&str, HashMap<String, Rescored>> = HashMap::new();

    for word1 in &guess1.ranked {
        let Some(s1) = guess1.scores.get(word1) else {
            continue;
        };
        let context = guess1.context.push_front(word1);
        let Some(rescored) = rescore(&context) else {
            debug!("rescoring unavailable");
            return Ok(None);
        };
        for word0 in &guess0.ranked {
            let (Some(s0), Some(r0)) = (guess0.scores.get(word0), rescored.get(word0)) else {
                continue;
            };
            pairs.push(Pair {
                word1: word1.as_str(),
                word0: word0.as_str(),
                score: pair_score(
                    s1.nonpredict,
                    s1.predict_weight,
                    s1.predict,
                    s0.nonpredict,
                    s0.predict_weight,
                    r0.predict,
                ),
                class: r0.class,
                predict1: s1.predict,
                predict0: r0.predict,
            });
        }
        rescorings.insert(word1.as_str(), rescored);
    }

    let Some(top_class) = pairs.iter().map(|p| p.class).max() else {
        return Ok(None);
    };
    let best = pairs
        .iter()
        .filter(|p| p.class >= top_class)
        .max_by(|a, b| {
            a.score
                .total_cmp(&b.score)
                // Prefer the pair the user already has on ties.
                .then_with(|| (a.word1 == guess1.chosen).cmp(&(b.word1 == guess1.chosen)))
                .then_with(|| (a.word0 == guess0.chosen).cmp(&(b.word0 == guess0.chosen)))
        });
    let Some(best) = best else {
        return Ok(None);
    };
    if best.word1 == guess1.chosen && best.word0 == guess0.chosen {
        return Ok(None);
    }

    let gain = best.score - original;
    let loss1 = orig1.predict - best.predict1;
    let loss0 = orig0.predict - best.predict0;
    debug!(
        word1 = best.word1,
        word0 = best.word0,
        gain,
        loss1,
        loss0,
        class = best.class,
        "best pair"
    );
    if gain <= settings.min_gain
        || loss1 > settings.max_predict_loss
        || loss0 > settings.max_predict_loss
    {
        return Ok(None);
    }

    let rescored = rescorings.remove(best.word1).unwrap_or_default();
    Ok(Some(PairChoice {
        word1: best.word1.to_string(),
        word0: best.word0.to_string(),
        score: best.score,
        original,
        rescored,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::WordCandidateScore;
    use crate::predictor::Capitalization;
    use crate::settings::Settings;
    use time::OffsetDateTime;

    fn score(nonpredict: f64, predict: f64) -> WordCandidateScore {
        let mut s = WordCandidateScore::new(nonpredict, Capitalization::Lower, false);
        s.nonpredict = nonpredict;
        s.predict = predict;
        s.predict_weight = 0.5;
        s.final_score = Some(nonpredict + 0.5 * predict);
        s.class = 4;
        s
    }

    fn record(id: u64, context: Context, words: &[(&str, f64, f64)], chosen: &str) -> GuessRecord {
        GuessRecord {
            id,
            timestamp: OffsetDateTime::UNIX_EPOCH,
            context,
            scores: words
                .iter()
                .map(|(w, np, p)| (w.to_string(), score(*np, *p)))
                .collect(),
            ranked: words.iter().map(|(w, _, _)| w.to_string()).collect(),
            chosen: chosen.to_string(),
        }
    }

    fn settings() -> BacktrackSettings {
        Settings::default().backtrack
    }

    fn rescored(pairs: &[(&str, f64, u8)]) -> HashMap<String, Rescored> {
        pairs
            .iter()
            .map(|(w, p, c)| (w.to_string(), Rescored { predict: *p, class: *c }))
            .collect()
    }

    /// "I" + {"fit", "got"} then {"it", "to"}: "got to" is far likelier.
    fn pair_history() -> (GuessRecord, GuessRecord) {
        let g1 = record(
            1,
            Context::new(["I", "#START"]),
            &[("fit", 0.80, 0.7), ("got", 0.78, 0.7)],
            "fit",
        );
        let g0 = record(
            2,
            Context::new(["fit", "I"]),
            &[("it", 0.80, 0.6), ("to", 0.78, 0.5)],
            "it",
        );
        (g1, g0)
    }

    fn rescorer(ctx: &Context) -> Option<HashMap<String, Rescored>> {
        match ctx.words()[0].as_str() {
            "got" => Some(rescored(&[("it", 0.3, 6), ("to", 1.0, 6)])),
            _ => Some(rescored(&[("it", 0.6, 4), ("to", 0.5, 4)])),
        }
    }

    #[test]
    fn chaining_is_case_insensitive() {
        let (g1, mut g0) = pair_history();
        assert!(chains(&g1, &g0));
        g0.context = Context::new(["FIT", "i"]);
        assert!(chains(&g1, &g0));
        g0.context = Context::new(["got", "I"]);
        assert!(!chains(&g1, &g0));
    }

    #[test]
    fn sentence_initial_guess_does_not_chain() {
        let (g1, mut g0) = pair_history();
        g0.context = Context::start();
        assert!(!chains(&g1, &g0));
    }

    #[test]
    fn better_pair_accepted() {
        let (g1, g0) = pair_history();
        let choice = best_pair(&g1, &g0, &settings(), rescorer).unwrap().unwrap();
        assert_eq!(choice.word1, "got");
        assert_eq!(choice.word0, "to");
        assert!(choice.score - choice.original > settings().min_gain);
        assert_eq!(choice.rescored["to"].predict, 1.0);
    }

    #[test]
    fn small_gain_rejected() {
        let (g1, g0) = pair_history();
        let mut s = settings();
        s.min_gain = 1.0;
        assert!(best_pair(&g1, &g0, &s, rescorer).unwrap().is_none());
    }

    #[test]
    fn predict_loss_guard() {
        let (g1, g0) = pair_history();
        let mut s = settings();
        s.max_predict_loss = 0.0;
        // "got" now trails the predict score of "fit".
        let mut g1 = g1;
        g1.scores.get_mut("got").unwrap().predict = 0.6;
        g1.scores.get_mut("got").unwrap().nonpredict = 0.9;
        assert!(best_pair(&g1, &g0, &s, rescorer).unwrap().is_none());
    }

    #[test]
    fn lower_class_never_wins() {
        let (g1, g0) = pair_history();
        let coarse = |ctx: &Context| match ctx.words()[0].as_str() {
            "got" => Some(rescored(&[("it", 0.3, 2), ("to", 1.0, 2)])),
            _ => Some(rescored(&[("it", 0.6, 4), ("to", 0.5, 4)])),
        };
        assert!(best_pair(&g1, &g0, &settings(), coarse).unwrap().is_none());
    }

    #[test]
    fn original_pair_stands() {
        let (g1, g0) = pair_history();
        let flat = |_: &Context| Some(rescored(&[("it", 0.6, 4), ("to", 0.5, 4)]));
        assert!(best_pair(&g1, &g0, &settings(), flat).unwrap().is_none());
    }

    #[test]
    fn chosen_word_missing_is_invariant_error() {
        let (g1, mut g0) = pair_history();
        g0.chosen = "ghost".to_string();
        let err = best_pair(&g1, &g0, &settings(), rescorer).unwrap_err();
        assert!(matches!(err, PredictError::Invariant(_)));
    }

    #[test]
    fn rescoring_failure_suppresses() {
        let (g1, g0) = pair_history();
        assert!(best_pair(&g1, &g0, &settings(), |_| None).unwrap().is_none());
    }
}
