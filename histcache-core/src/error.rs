//! Structured error types for cache operations.
//!
//! Every variant aborts the `update` call that produced it. None of them are
//! retried by the cache itself; calling `update` again re-enumerates whatever
//! is still missing.

use polars::prelude::PolarsError;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type CacheResult<T> = Result<T, CacheError>;

/// One failed chunk fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFailure {
    /// Display form of the chunk key.
    pub key: String,
    /// Error chain reported by the fetcher (or the task panic message).
    pub message: String,
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to fetch {} chunk(s): {}", .failures.len(), format_failures(.failures))]
    ChunkFetch { failures: Vec<ChunkFailure> },

    #[error("cache integrity violated: {0}")]
    Integrity(String),

    #[error("cache store error: {0}")]
    Store(String),

    #[error("corrupt cache record at {location}: {reason}")]
    Corrupt { location: String, reason: String },

    #[error("an update is already running for {location}")]
    UpdateInProgress { location: String },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl CacheError {
    /// Keys of the chunks that failed, if this is a fetch failure.
    pub fn failed_keys(&self) -> Vec<&str> {
        match self {
            CacheError::ChunkFetch { failures } => {
                failures.iter().map(|f| f.key.as_str()).collect()
            }
            _ => Vec::new(),
        }
    }

    pub(crate) fn store(context: &str, err: impl std::fmt::Display) -> Self {
        CacheError::Store(format!("{context}: {err}"))
    }

    pub(crate) fn integrity_from_polars(context: &str, err: PolarsError) -> Self {
        CacheError::Integrity(format!("{context}: {err}"))
    }
}

fn format_failures(failures: &[ChunkFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("[{}] {}", f.key, f.message))
        .collect::<Vec<_>>()
        .join("; ")
}
