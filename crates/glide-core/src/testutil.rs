//! Small English model shared by the predictor tests.

use time::{Duration, OffsetDateTime};

use crate::predictor::Candidate;
use crate::store::MemoryStore;
use crate::token::{GramKey, ReservedToken, WordId};

pub const THE: WordId = WordId(1);
pub const THEN: WordId = WordId(2);
pub const THERE: WordId = WordId(3);
pub const THEIR: WordId = WordId(4);
pub const GO: WordId = WordId(5);
pub const OVER: WordId = WordId(6);
pub const CAT: WordId = WordId(7);
pub const FIT: WordId = WordId(8);
pub const GOT: WordId = WordId(9);
pub const IT: WordId = WordId(10);
pub const TO: WordId = WordId(11);
pub const IO: WordId = WordId(12);

/// A fixed instant, so day arithmetic is reproducible.
pub fn at(secs: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap() + Duration::seconds(secs)
}

pub fn cand(word: &str, curve: f64) -> Candidate {
    Candidate::new(word, curve)
}

pub fn fixture_store() -> MemoryStore {
    let mut s = MemoryStore::new();
    for (word, id) in [
        ("the", THE),
        ("then", THEN),
        ("there", THERE),
        ("their", THEIR),
        ("go", GO),
        ("over", OVER),
        ("cat", CAT),
        ("fit", FIT),
        ("got", GOT),
        ("it", IT),
        ("to", TO),
        ("io", IO),
    ] {
        s.add_stock_word(word, id, None);
    }
    let start = ReservedToken::Start.id();
    let unigram = |id| GramKey::new(id, &[], 1);

    s.add_stock(unigram(THE), 5000, false);
    s.add_stock(unigram(THEN), 100, false);
    s.add_stock(unigram(THERE), 400, false);
    s.add_stock(unigram(THEIR), 400, false);
    s.add_stock(unigram(GO), 300, false);
    s.add_stock(unigram(OVER), 300, false);
    s.add_stock(unigram(CAT), 50, false);
    s.add_stock(unigram(FIT), 300, false);
    s.add_stock(unigram(GOT), 300, false);
    s.add_stock(unigram(IT), 500, false);
    s.add_stock(unigram(TO), 500, false);
    s.add_stock(unigram(IO), 100_000, false);

    // "go over there" is a little more common than "go over their".
    s.add_stock(GramKey::new(THERE, &[OVER], 2), 40, false);
    s.add_stock(GramKey::new(THEIR, &[OVER], 2), 36, false);
    s.add_stock(GramKey::new(THERE, &[OVER, GO], 3), 20, false);
    s.add_stock(GramKey::new(THEIR, &[OVER, GO], 3), 18, false);

    s.add_stock(GramKey::new(TO, &[GOT], 2), 200, false);
    s.add_stock(GramKey::new(GO, &[start], 2), 30, false);
    s
}
