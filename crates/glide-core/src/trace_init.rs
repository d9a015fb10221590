//! JSON-lines trace of ranking decisions, for replaying a typing session
//! offline. Compiled in with the `trace` feature; otherwise every call is a
//! no-op and the `tracing` macros are disabled at compile time.

use std::io;
use std::path::Path;

/// File written inside the host's log directory.
pub const TRACE_FILE: &str = "glide-trace.jsonl";

/// Directive used when neither the caller nor `RUST_LOG` sets one.
pub const DEFAULT_FILTER: &str = "glide_core=debug";

#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("trace directory: {0}")]
    Io(#[from] io::Error),
    #[error("trace file: {0}")]
    Appender(String),
    #[error("invalid trace filter {directive:?}: {reason}")]
    Filter { directive: String, reason: String },
    #[error("a global tracing subscriber is already installed")]
    AlreadyInstalled,
}

/// Keeps the background writer alive. Dropping it flushes pending lines.
#[must_use = "dropping the guard stops trace output"]
pub struct TraceGuard {
    #[cfg(feature = "trace")]
    _worker: tracing_appender::non_blocking::WorkerGuard,
}

/// Route this crate's spans (`guess`, `score_candidates`, `filter`,
/// `commit`, `backtrack`) and decision events to `log_dir/glide-trace.jsonl`.
///
/// `filter` overrides the `RUST_LOG` directive, which in turn overrides
/// [`DEFAULT_FILTER`]. Closed spans carry their busy time, so the file doubles
/// as a latency profile of `guess`.
#[cfg(feature = "trace")]
pub fn init_tracing(log_dir: &Path, filter: Option<&str>) -> Result<TraceGuard, TraceError> {
    use tracing_subscriber::fmt::format::FmtSpan;
    use tracing_subscriber::EnvFilter;

    let env_filter = match filter {
        Some(directive) => EnvFilter::try_new(directive).map_err(|e| TraceError::Filter {
            directive: directive.to_string(),
            reason: e.to_string(),
        })?,
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
    };

    std::fs::create_dir_all(log_dir)?;
    let file_appender = tracing_appender::rolling::RollingFileAppender::builder()
        .rotation(tracing_appender::rolling::Rotation::NEVER)
        .filename_prefix(TRACE_FILE)
        .build(log_dir)
        .map_err(|e| TraceError::Appender(e.to_string()))?;
    let (non_blocking, worker) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .json()
        .with_writer(non_blocking)
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_env_filter(env_filter)
        .try_init()
        .map_err(|_| TraceError::AlreadyInstalled)?;
    Ok(TraceGuard { _worker: worker })
}

#[cfg(not(feature = "trace"))]
pub fn init_tracing(_log_dir: &Path, _filter: Option<&str>) -> Result<TraceGuard, TraceError> {
    Ok(TraceGuard {})
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::predictor::Predictor;
    use crate::testutil::{at, cand, fixture_store};

    fn rank_once() {
        let mut p = Predictor::new(Some(Box::new(fixture_store())), None).unwrap();
        p.guess_at(
            &[cand("there", 0.8), cand("their", 0.8)],
            &Context::new(["over", "go"]),
            None,
            at(0),
        );
    }

    #[cfg(feature = "trace")]
    #[test]
    fn installs_json_subscriber_once() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("logs");
        let guard = init_tracing(&log_dir, Some("glide_core=debug")).unwrap();
        rank_once();
        drop(guard);

        let text = std::fs::read_to_string(log_dir.join(TRACE_FILE)).unwrap();
        // A workspace-wide `max_level_off` still wins over the feature.
        if tracing::level_filters::STATIC_MAX_LEVEL >= tracing::level_filters::LevelFilter::DEBUG {
            assert!(text.contains("\"guess\""));
            assert!(text.contains("ranked"));
        }
        assert!(matches!(
            init_tracing(&log_dir, None),
            Err(TraceError::AlreadyInstalled)
        ));
    }

    #[cfg(feature = "trace")]
    #[test]
    fn rejects_bad_filter() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            init_tracing(dir.path(), Some("glide_core=loud")),
            Err(TraceError::Filter { .. })
        ));
    }

    #[cfg(not(feature = "trace"))]
    #[test]
    fn disabled_without_feature() {
        let dir = tempfile::tempdir().unwrap();
        let _guard = init_tracing(dir.path(), None).unwrap();
        rank_once();
        assert!(!dir.path().join(TRACE_FILE).exists());
    }
}
