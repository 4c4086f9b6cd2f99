//! Error type shared by the history backends, the lazy codec and the garbage collector.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HistoryError {
    /// A session file (or in-memory document) does not have the indexed layout.
    #[error("invalid history document: {0}")]
    InvalidFormat(String),

    /// A lazy map node was asked for a key it does not contain.
    #[error("key not found: {0:?}")]
    KeyNotFound(String),

    /// A sequence index was outside of `0..len`.
    #[error("history index {index} out of range for length {len}")]
    IndexOutOfRange { index: isize, len: usize },

    /// A lazy read ran past the end of the file.
    #[error("truncated data: wanted {wanted} bytes at offset {offset}")]
    TruncatedData { offset: u64, wanted: usize },

    /// The configured backend name is not known.
    #[error("unknown history backend: {0}")]
    UnknownBackend(String),

    /// Writing a flush unit to its session file failed. The unit keeps its queue slot.
    #[error("failed to write history to {}: {source}", path.display())]
    FlushWriteFailure {
        path: PathBuf,
        #[source]
        source: Arc<std::io::Error>,
    },

    /// Removing or inspecting a single file during garbage collection failed.
    #[error("history gc could not process {}: {source}", path.display())]
    GcFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// `XONSH_HISTORY_SIZE` (or a gc request) named units we do not understand.
    #[error("units type {0:?} not understood")]
    InvalidRetentionUnits(String),

    /// The data directory holding the session files is missing or unreadable.
    #[error("history data directory {} is not accessible: {source}", path.display())]
    DataDirMissing {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

pub type Result<T, E = HistoryError> = std::result::Result<T, E>;

impl HistoryError {
    /// Build a flush failure for the given session file.
    pub(crate) fn flush_failure(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        HistoryError::FlushWriteFailure {
            path: path.into(),
            source: Arc::new(source),
        }
    }

    /// Flush failures are reported to every waiter on a blocked queue, so they must be cloned.
    pub(crate) fn clone_flush_failure(&self) -> Option<Self> {
        match self {
            HistoryError::FlushWriteFailure { path, source } => {
                Some(HistoryError::FlushWriteFailure {
                    path: path.clone(),
                    source: Arc::clone(source),
                })
            }
            _ => None,
        }
    }
}

impl From<json::Error> for HistoryError {
    fn from(err: json::Error) -> Self {
        HistoryError::InvalidFormat(err.to_string())
    }
}
