//! Session history. Here is how a shell session's commands are recorded:
//!
//! 1. Each executed command is appended to an in-memory buffer, unless the ignore policy
//!    (`HISTCONTROL` and the ignore regex) rejects it. A rejected command is not counted.
//!
//! 2. When the buffer fills up, its contents are handed to the flush queue as one unit and the
//!    buffer starts over. Flush units are applied to the session file in the order they were
//!    created, on a single worker thread.
//!
//! 3. A session file is an indexed JSON document (see `lazy_json`), so reading back one old
//!    command does not require parsing the whole file. Such reads go through the same queue as
//!    writes, and so always observe every earlier flush.
//!
//! 4. At session end the final flush marks the file closed. Closed files are eventually removed
//!    by the garbage collector, according to the retention budget.
//!
//! Several storage engines implement [`HistoryBackend`]; [`History`] wraps the one chosen by
//! the configuration.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use json::JsonValue;
use regex::Regex;

use crate::config::{BackendKind, HistControl, HistoryConfig, HistorySize};
use crate::error::{HistoryError, Result};
use crate::flog::{flog, flogf};
use crate::history::dummy::DummyHistory;
use crate::history::flusher::FlushHandle;
use crate::history::gc::GcHandle;
use crate::history::json_backend::JsonHistory;
use crate::history::sqlite_backend::SqliteHistory;

pub(crate) struct TimeProfiler {
    what: &'static str,
    start: Instant,
}

impl TimeProfiler {
    pub(crate) fn new(what: &'static str) -> Self {
        let start = Instant::now();
        Self { what, start }
    }
}

impl Drop for TimeProfiler {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        flogf!(
            profile_history,
            "{}: {}.{:06} ms",
            self.what,
            duration.as_millis(),
            duration.as_nanos() % 1_000_000
        );
    }
}

/// When a command ran, in seconds since the epoch. `end` is unset while it is running.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TimestampSpan {
    pub start: f64,
    pub end: Option<f64>,
}

impl TimestampSpan {
    pub fn new(start: f64, end: Option<f64>) -> Self {
        Self { start, end }
    }

    pub fn to_json(self) -> JsonValue {
        let end = self.end.map_or(JsonValue::Null, JsonValue::from);
        JsonValue::Array(vec![self.start.into(), end])
    }

    pub fn from_json(value: &JsonValue) -> Result<Self> {
        let start = value[0]
            .as_f64()
            .ok_or_else(|| HistoryError::InvalidFormat(format!("bad timestamp: {}", value.dump())))?;
        Ok(Self {
            start,
            end: value[1].as_f64(),
        })
    }
}

/// One executed command.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CommandEntry {
    /// The command as typed, possibly with a trailing newline.
    pub input: String,
    /// Exit status, unset for a command that has not finished.
    pub return_code: Option<i32>,
    /// Captured output, kept only when output storage is enabled.
    pub output: Option<String>,
    pub timestamp: TimestampSpan,
    pub cwd: Option<String>,
    /// The command was typed with a leading space. This is not stored.
    pub space_prefixed: bool,
}

impl CommandEntry {
    pub fn new(input: impl Into<String>, return_code: Option<i32>, timestamp: TimestampSpan) -> Self {
        Self {
            input: input.into(),
            return_code,
            timestamp,
            ..Default::default()
        }
    }

    /// Encode as a session file entry.
    pub fn to_json(&self) -> JsonValue {
        let mut obj = JsonValue::new_object();
        obj["inp"] = self.input.as_str().into();
        obj["rtn"] = self.return_code.map_or(JsonValue::Null, JsonValue::from);
        obj["ts"] = self.timestamp.to_json();
        if let Some(out) = &self.output {
            obj["out"] = out.as_str().into();
        }
        if let Some(cwd) = &self.cwd {
            obj["cwd"] = cwd.as_str().into();
        }
        obj
    }

    /// Decode a session file entry. Only the input is required.
    pub fn from_json(obj: &JsonValue) -> Result<Self> {
        let input = obj["inp"]
            .as_str()
            .ok_or_else(|| HistoryError::InvalidFormat("entry without input".into()))?;
        let timestamp = if obj["ts"].is_null() {
            TimestampSpan::default()
        } else {
            TimestampSpan::from_json(&obj["ts"])?
        };
        Ok(Self {
            input: input.to_owned(),
            return_code: obj["rtn"].as_i32(),
            output: obj["out"].as_str().map(str::to_owned),
            timestamp,
            cwd: obj["cwd"].as_str().map(str::to_owned),
            space_prefixed: false,
        })
    }
}

/// A command as listed by `items()` and `all_items()`.
#[derive(Clone, Debug, PartialEq)]
pub struct HistoryItem {
    /// The input with trailing whitespace removed.
    pub input: String,
    /// When the command started.
    pub timestamp: f64,
    pub return_code: Option<i32>,
    pub session_id: Option<String>,
}

impl HistoryItem {
    pub fn from_entry(entry: &CommandEntry, session_id: Option<&str>) -> Self {
        Self {
            input: entry.input.trim_end().to_owned(),
            timestamp: entry.timestamp.start,
            return_code: entry.return_code,
            session_id: session_id.map(str::to_owned),
        }
    }
}

/// Which entries to pick: a single index, or a range with a step. Negative positions count
/// from the end, as do `start` and `stop` in a range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HistorySlice {
    Index(isize),
    Range {
        start: Option<isize>,
        stop: Option<isize>,
        step: isize,
    },
}

impl HistorySlice {
    /// Every entry, oldest first.
    pub const ALL: HistorySlice = HistorySlice::Range {
        start: None,
        stop: None,
        step: 1,
    };

    pub fn range(start: Option<isize>, stop: Option<isize>) -> Self {
        HistorySlice::Range {
            start,
            stop,
            step: 1,
        }
    }

    /// Resolve against a sequence of `len` entries.
    pub fn indices(&self, len: usize) -> Result<Vec<usize>> {
        match *self {
            HistorySlice::Index(i) => Ok(vec![normalize_index(i, len)?]),
            HistorySlice::Range { start, stop, step } => {
                if step == 0 {
                    return Err(HistoryError::InvalidFormat("slice step cannot be zero".into()));
                }
                let len = len as isize;
                let clamp = |v: isize, lo: isize, hi: isize| v.clamp(lo, hi);
                let resolve = |v: isize| if v < 0 { v + len } else { v };
                let mut out = vec![];
                if step > 0 {
                    let start = start.map_or(0, |s| clamp(resolve(s), 0, len));
                    let stop = stop.map_or(len, |s| clamp(resolve(s), 0, len));
                    let mut i = start;
                    while i < stop {
                        out.push(i as usize);
                        i += step;
                    }
                } else {
                    let start = start.map_or(len - 1, |s| clamp(resolve(s), -1, len - 1));
                    let stop = stop.map_or(-1, |s| clamp(resolve(s), -1, len - 1));
                    let mut i = start;
                    while i > stop {
                        out.push(i as usize);
                        i += step;
                    }
                }
                Ok(out)
            }
        }
    }
}

impl fmt::Display for HistorySlice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let opt = |v: Option<isize>| v.map(|v| v.to_string()).unwrap_or_default();
        match *self {
            HistorySlice::Index(i) => write!(f, "{i}"),
            HistorySlice::Range { start, stop, step } if step == 1 => {
                write!(f, "{}:{}", opt(start), opt(stop))
            }
            HistorySlice::Range { start, stop, step } => {
                write!(f, "{}:{}:{}", opt(start), opt(stop), step)
            }
        }
    }
}

impl FromStr for HistorySlice {
    type Err = HistoryError;

    /// Parses `5`, `-1`, `2:`, `:-3`, `1:10:2`.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || HistoryError::InvalidFormat(format!("invalid history slice: {s:?}"));
        let field = |part: &str| -> Result<Option<isize>> {
            let part = part.trim();
            if part.is_empty() {
                Ok(None)
            } else {
                part.parse().map(Some).map_err(|_| invalid())
            }
        };
        let parts: Vec<&str> = s.split(':').collect();
        match parts.as_slice() {
            [index] => field(index)?.map(HistorySlice::Index).ok_or_else(invalid),
            [start, stop] => Ok(HistorySlice::range(field(start)?, field(stop)?)),
            [start, stop, step] => Ok(HistorySlice::Range {
                start: field(start)?,
                stop: field(stop)?,
                step: field(step)?.unwrap_or(1),
            }),
            _ => Err(invalid()),
        }
    }
}

/// A single field of a command entry, as stored in the session file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryField {
    Input,
    ReturnCode,
    Output,
    Timestamp,
    Cwd,
}

impl EntryField {
    pub fn key(self) -> &'static str {
        match self {
            EntryField::Input => "inp",
            EntryField::ReturnCode => "rtn",
            EntryField::Output => "out",
            EntryField::Timestamp => "ts",
            EntryField::Cwd => "cwd",
        }
    }

    /// The field of an encoded entry, null if absent.
    pub fn of(self, entry: &JsonValue) -> JsonValue {
        entry[self.key()].clone()
    }
}

/// Resolve a possibly negative index against `len` entries.
pub fn normalize_index(index: isize, len: usize) -> Result<usize> {
    let resolved = if index < 0 {
        index + len as isize
    } else {
        index
    };
    if resolved < 0 || resolved as usize >= len {
        return Err(HistoryError::IndexOutOfRange { index, len });
    }
    Ok(resolved as usize)
}

/// The rules deciding which commands are not recorded.
#[derive(Clone, Debug, Default)]
pub struct IgnorePolicy {
    pub control: HistControl,
    pub regex: Option<Regex>,
}

impl IgnorePolicy {
    pub fn from_config(config: &HistoryConfig) -> Self {
        Self {
            control: config.hist_control,
            regex: config.ignore_regex.clone(),
        }
    }

    /// Whether `entry` should be dropped, given the input of the last recorded command.
    pub fn should_ignore(&self, entry: &CommandEntry, last_input: Option<&str>) -> bool {
        if self.control.contains(HistControl::IGNORE_DUPS) && last_input == Some(&entry.input) {
            return true;
        }
        // Unfinished commands count as failed.
        if self.control.contains(HistControl::IGNORE_ERR) && entry.return_code != Some(0) {
            return true;
        }
        if self.control.contains(HistControl::IGNORE_SPACE) && entry.space_prefixed {
            return true;
        }
        self.regex
            .as_ref()
            .and_then(|re| re.find(&entry.input))
            .is_some_and(|m| m.start() == 0)
    }
}

/// The operations every storage engine supports.
pub trait HistoryBackend: Send {
    fn kind(&self) -> BackendKind;

    fn session_id(&self) -> &str;

    /// Where this session is stored, if anywhere.
    fn file(&self) -> Option<&Path>;

    /// Record a command. Returns a handle if this started a flush.
    fn append(&mut self, entry: CommandEntry) -> Result<Option<FlushHandle>>;

    /// Write out buffered commands. At exit the session is also marked closed, and the call
    /// blocks until the write is done.
    fn flush(&mut self, at_exit: bool) -> Result<Option<FlushHandle>>;

    /// Commands of this session, oldest first unless `newest_first`.
    fn items(&self, newest_first: bool) -> Result<Vec<HistoryItem>>;

    /// Commands of every stored session followed by this one's.
    fn all_items(&self, newest_first: bool) -> Result<Vec<HistoryItem>>;

    /// Start a garbage collection. `size` defaults to the configured budget. Unless `force`
    /// is set, nothing is deleted when more would be removed than kept.
    fn run_gc(
        &self,
        size: Option<HistorySize>,
        blocking: bool,
        force: bool,
    ) -> Result<GcHandle>;

    /// Start the collection that runs once the shell has finished starting.
    fn start_gc(&self) -> Result<()> {
        Ok(())
    }

    /// Called once the shell is fully started, releasing a collection waiting in `start_gc`.
    fn startup_finished(&self) {}

    /// A summary of the backend's state, in display order.
    fn info(&self) -> Vec<(&'static str, String)>;

    /// Number of commands recorded in this session.
    fn len(&self) -> usize;

    /// The command at `index`, counting from the oldest.
    fn get(&self, index: isize) -> Result<CommandEntry>;

    fn slice(&self, slice: HistorySlice) -> Result<Vec<CommandEntry>> {
        slice
            .indices(self.len())?
            .into_iter()
            .map(|i| self.get(i as isize))
            .collect()
    }

    /// One field of the commands picked by `slice`. Missing fields are null.
    fn field(&self, field: EntryField, slice: HistorySlice) -> Result<Vec<JsonValue>> {
        Ok(self
            .slice(slice)?
            .iter()
            .map(|entry| field.of(&entry.to_json()))
            .collect())
    }

    /// Forget this session's commands.
    fn clear(&mut self) -> Result<()>;

    /// Turn recording on or off.
    fn set_remember(&mut self, remember: bool);

    fn remember(&self) -> bool;
}

/// Build the backend chosen by `config`. A backend that cannot be created leaves the session
/// without history rather than failing.
pub fn construct_history(config: &HistoryConfig) -> Box<dyn HistoryBackend> {
    let backend: Result<Box<dyn HistoryBackend>> = match config.backend {
        BackendKind::Json => JsonHistory::new(config).map(|h| Box::new(h) as _),
        BackendKind::Sqlite => SqliteHistory::new(config).map(|h| Box::new(h) as _),
        BackendKind::Dummy => Ok(Box::new(DummyHistory::new())),
    };
    match backend {
        Ok(backend) => {
            flog!(
                history,
                "Using",
                config.backend.name(),
                "history for session",
                backend.session_id()
            );
            backend
        }
        Err(err) => {
            flog!(
                error,
                "Could not start",
                config.backend.name(),
                "history:",
                err,
                "- history is disabled for this session."
            );
            Box::new(DummyHistory::new())
        }
    }
}

/// A session's history, shareable between threads.
pub struct History(Mutex<Box<dyn HistoryBackend>>);

impl History {
    fn imp(&self) -> MutexGuard<'_, Box<dyn HistoryBackend>> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn new(backend: Box<dyn HistoryBackend>) -> Arc<Self> {
        Arc::new(Self(Mutex::new(backend)))
    }

    pub fn from_config(config: &HistoryConfig) -> Arc<Self> {
        Self::new(construct_history(config))
    }

    pub fn kind(&self) -> BackendKind {
        self.imp().kind()
    }

    pub fn session_id(&self) -> String {
        self.imp().session_id().to_owned()
    }

    pub fn file(&self) -> Option<std::path::PathBuf> {
        self.imp().file().map(Path::to_path_buf)
    }

    pub fn append(&self, entry: CommandEntry) -> Result<Option<FlushHandle>> {
        self.imp().append(entry)
    }

    pub fn flush(&self) -> Result<Option<FlushHandle>> {
        self.imp().flush(false)
    }

    /// Final flush of the session; blocks until it is written.
    pub fn close(&self) -> Result<()> {
        self.imp().flush(true).map(|_| ())
    }

    pub fn items(&self, newest_first: bool) -> Result<Vec<HistoryItem>> {
        self.imp().items(newest_first)
    }

    pub fn all_items(&self, newest_first: bool) -> Result<Vec<HistoryItem>> {
        self.imp().all_items(newest_first)
    }

    pub fn run_gc(
        &self,
        size: Option<HistorySize>,
        blocking: bool,
        force: bool,
    ) -> Result<GcHandle> {
        self.imp().run_gc(size, blocking, force)
    }

    pub fn start_gc(&self) -> Result<()> {
        self.imp().start_gc()
    }

    pub fn startup_finished(&self) {
        self.imp().startup_finished();
    }

    pub fn info(&self) -> Vec<(&'static str, String)> {
        self.imp().info()
    }

    pub fn len(&self) -> usize {
        self.imp().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: isize) -> Result<CommandEntry> {
        self.imp().get(index)
    }

    pub fn slice(&self, slice: HistorySlice) -> Result<Vec<CommandEntry>> {
        self.imp().slice(slice)
    }

    pub fn field(&self, field: EntryField, slice: HistorySlice) -> Result<Vec<JsonValue>> {
        self.imp().field(field, slice)
    }

    pub fn clear(&self) -> Result<()> {
        self.imp().clear()
    }

    pub fn set_remember(&self, remember: bool) {
        self.imp().set_remember(remember);
    }

    pub fn remember(&self) -> bool {
        self.imp().remember()
    }
}
