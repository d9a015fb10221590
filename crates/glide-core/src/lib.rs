//! Predictive ranking core for swipe/curve text entry.
//!
//! Candidates produced by a curve recognizer are ranked by blending their
//! curve score with an n-gram language model (stock corpus counts plus
//! counts learned from the user), and earlier guesses can be revised once a
//! later word makes a different pair more likely.

pub mod aggregate;
pub mod backtrack;
pub mod context;
pub mod error;
pub mod filter;
pub mod history;
pub mod learn;
pub mod predictor;
pub mod quality;
pub mod resolver;
pub mod settings;
pub mod store;
pub mod token;
pub mod trace_init;

#[cfg(test)]
pub(crate) mod testutil;

pub use backtrack::Backtrack;
pub use context::Context;
pub use error::PredictError;
pub use predictor::{Candidate, Capitalization, Predictor, RankedWord};
pub use settings::Settings;
pub use store::{GramCount, MemoryStore, NGramStore, StoreError, WordInfo};
pub use token::{GramKey, ReservedToken, WordId};
