//! A backend that records nothing, for sessions without history.

use std::path::Path;

use crate::config::{BackendKind, HistorySize};
use crate::error::{HistoryError, Result};
use crate::flog::flog;
use crate::history::file::new_session_id;
use crate::history::flusher::FlushHandle;
use crate::history::gc::{GcHandle, GcOutcome};
use crate::history::history::{CommandEntry, HistoryBackend, HistoryItem, TimestampSpan};

/// The single command every dummy history reports.
const PLACEHOLDER_INPUT: &str = "dummy in action";
const PLACEHOLDER_TIMESTAMP: f64 = 1464652800.0;

pub struct DummyHistory {
    session_id: String,
    remember: bool,
}

impl DummyHistory {
    pub fn new() -> Self {
        Self {
            session_id: new_session_id(),
            remember: true,
        }
    }

    fn placeholder() -> CommandEntry {
        CommandEntry::new(
            PLACEHOLDER_INPUT,
            None,
            TimestampSpan::new(PLACEHOLDER_TIMESTAMP, None),
        )
    }
}

impl Default for DummyHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl HistoryBackend for DummyHistory {
    fn kind(&self) -> BackendKind {
        BackendKind::Dummy
    }

    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn file(&self) -> Option<&Path> {
        None
    }

    fn append(&mut self, entry: CommandEntry) -> Result<Option<FlushHandle>> {
        flog!(history, "Discarding", entry.input.trim_end());
        Ok(None)
    }

    fn flush(&mut self, _at_exit: bool) -> Result<Option<FlushHandle>> {
        Ok(None)
    }

    fn items(&self, _newest_first: bool) -> Result<Vec<HistoryItem>> {
        Ok(vec![HistoryItem::from_entry(&Self::placeholder(), None)])
    }

    fn all_items(&self, newest_first: bool) -> Result<Vec<HistoryItem>> {
        self.items(newest_first)
    }

    fn run_gc(&self, _size: Option<HistorySize>, _blocking: bool, _force: bool) -> Result<GcHandle> {
        Ok(GcHandle::finished(Ok(GcOutcome::default())))
    }

    fn info(&self) -> Vec<(&'static str, String)> {
        vec![
            ("backend", self.kind().name().to_owned()),
            ("sessionid", self.session_id.clone()),
        ]
    }

    fn len(&self) -> usize {
        0
    }

    /// Nothing is recorded, so there is nothing to index.
    fn get(&self, index: isize) -> Result<CommandEntry> {
        Err(HistoryError::IndexOutOfRange { index, len: 0 })
    }

    fn clear(&mut self) -> Result<()> {
        Ok(())
    }

    fn set_remember(&mut self, remember: bool) {
        self.remember = remember;
    }

    fn remember(&self) -> bool {
        self.remember
    }
}
