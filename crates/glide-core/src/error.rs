use std::io;

use crate::settings::SettingsError;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum PredictError {
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("settings error: {0}")]
    Settings(#[from] SettingsError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Guess bookkeeping disagrees with itself. Continuing would corrupt
    /// learning, so this is never swallowed.
    #[error("internal invariant violated: {0}")]
    Invariant(String),
}
