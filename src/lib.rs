//! Shell session history: recording, lazy retrieval and garbage collection of the commands a
//! shell runs.

mod flog;

pub mod config;
pub mod error;
pub mod history;

pub use config::{BackendKind, HistControl, HistoryConfig, HistorySize, SizeUnits};
pub use error::{HistoryError, Result};
pub use history::{CommandEntry, History, HistoryBackend, HistoryItem, HistorySlice};
