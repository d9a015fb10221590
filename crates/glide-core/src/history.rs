//! Snapshots of recent rankings, kept for backtracking and auto-tuning.

use std::collections::{HashMap, VecDeque};

use time::OffsetDateTime;

use crate::context::Context;
use crate::predictor::Capitalization;

/// How one candidate was scored in one ranking call.
#[derive(Clone, Debug, PartialEq)]
pub struct WordCandidateScore {
    pub curve: f64,
    pub capitalization: Capitalization,
    pub star: bool,
    /// Combined score; unset until the candidate has been ranked.
    pub final_score: Option<f64>,
    /// Human-readable scoring trace, only built when debug logging is on.
    pub trace: Option<String>,
    pub predict: f64,
    pub predict_weight: f64,
    /// `final_score` without the language-model part.
    pub nonpredict: f64,
    pub quality_index: f64,
    /// Specificity class of the evidence behind `predict`.
    pub class: u8,
}

impl WordCandidateScore {
    pub fn new(curve: f64, capitalization: Capitalization, star: bool) -> Self {
        Self {
            curve,
            capitalization,
            star,
            final_score: None,
            trace: None,
            predict: 0.0,
            predict_weight: 0.0,
            nonpredict: 0.0,
            quality_index: 0.5,
            class: 0,
        }
    }

    pub fn score(&self) -> f64 {
        self.final_score.unwrap_or(self.nonpredict)
    }
}

#[derive(Clone, Debug)]
pub struct GuessRecord {
    /// Correlation id, increasing per predictor instance.
    pub id: u64,
    pub timestamp: OffsetDateTime,
    pub context: Context,
    pub scores: HashMap<String, WordCandidateScore>,
    /// Candidates in ranked order.
    pub ranked: Vec<String>,
    pub chosen: String,
}

impl GuessRecord {
    pub fn chosen_score(&self) -> Option<&WordCandidateScore> {
        self.scores.get(&self.chosen)
    }
}

/// Most recent record first; the oldest is evicted past `capacity`.
#[derive(Clone, Debug)]
pub struct GuessHistory {
    records: VecDeque<GuessRecord>,
    capacity: usize,
}

impl GuessHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, record: GuessRecord) {
        self.records.push_front(record);
        self.records.truncate(self.capacity);
    }

    /// `get(0)` is the most recent guess.
    pub fn get(&self, index: usize) -> Option<&GuessRecord> {
        self.records.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut GuessRecord> {
        self.records.get_mut(index)
    }

    pub fn find_mut(&mut self, id: u64) -> Option<&mut GuessRecord> {
        self.records.iter_mut().find(|r| r.id == id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: u64) -> GuessRecord {
        GuessRecord {
            id,
            timestamp: OffsetDateTime::UNIX_EPOCH,
            context: Context::start(),
            scores: HashMap::new(),
            ranked: Vec::new(),
            chosen: format!("w{id}"),
        }
    }

    #[test]
    fn newest_first_and_bounded() {
        let mut h = GuessHistory::new(3);
        for id in 1..=5 {
            h.push(record(id));
        }
        assert_eq!(h.len(), 3);
        assert_eq!(h.get(0).unwrap().id, 5);
        assert_eq!(h.get(2).unwrap().id, 3);
        assert!(h.get(3).is_none());
        assert!(h.find_mut(1).is_none());
        assert!(h.find_mut(4).is_some());
    }

    #[test]
    fn unranked_score_falls_back_to_nonpredict() {
        let mut s = WordCandidateScore::new(0.8, Capitalization::Lower, false);
        s.nonpredict = 0.4;
        assert_eq!(s.score(), 0.4);
        s.final_score = Some(0.9);
        assert_eq!(s.score(), 0.9);
    }
}
