//! Garbage collection of closed session files.
//!
//! A sweep lists the session files in the data directory, picks the ones that fall outside the
//! retention budget, and deletes them. There is one policy per unit of the budget:
//!
//! - `commands`: keep the newest files whose command counts fit the limit.
//! - `files`: keep the newest `limit` files.
//! - `b`: keep the newest files whose sizes fit the limit.
//! - `s`: remove files closed at least `limit` seconds ago.
//!
//! Unless forced, the count, file and byte policies refuse to remove more than they keep.
//! The age policy has no such guard.
//!
//! Deletion is best effort. A file that vanished is as good as deleted, and any other failure
//! only skips that file.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use itertools::Itertools;
use json::JsonValue;

use crate::config::{HistorySize, SizeUnits};
use crate::error::{HistoryError, Result};
use crate::flog::{flog, flogf};
use crate::history::file::{boot_time, is_session_file_name, now_secs, rewrite_via_temporary_file};
use crate::history::history::TimeProfiler;
use crate::history::lazy_json::{self, LazyNode, LazyValue};

/// A session file that may be collected.
#[derive(Clone, Debug, PartialEq)]
pub struct GcCandidate {
    /// When the session closed (or started, if it never closed).
    pub closed_at: f64,
    pub command_count: usize,
    pub path: PathBuf,
    /// Size on disk in bytes.
    pub file_size: u64,
}

/// Signals that the shell has finished starting, so that a sweep does not race with startup.
#[derive(Default)]
pub struct StartupGate {
    started: Mutex<bool>,
    cond: Condvar,
}

impl StartupGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn open(&self) {
        let mut started = self.started.lock().unwrap_or_else(|e| e.into_inner());
        *started = true;
        self.cond.notify_all();
    }

    pub fn is_open(&self) -> bool {
        *self.started.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn wait(&self) {
        let mut started = self.started.lock().unwrap_or_else(|e| e.into_inner());
        while !*started {
            started = self.cond.wait(started).unwrap_or_else(|e| e.into_inner());
        }
    }
}

/// Where the last sweep's view of the history size is kept, for `info()`.
pub type LastGcSize = Arc<Mutex<Option<HistorySize>>>;

/// What a sweep should do.
#[derive(Clone)]
pub struct GcRequest {
    pub data_dir: PathBuf,
    pub size: HistorySize,
    /// Delete even if more would be removed than kept.
    pub force: bool,
    /// Wait for this gate before sweeping.
    pub startup: Option<Arc<StartupGate>>,
    pub last_size: Option<LastGcSize>,
}

/// The result of a sweep.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GcOutcome {
    /// How much history the policy wanted to remove, in the budget's units.
    pub amount: f64,
    pub removed: Vec<PathBuf>,
    /// The guard kept the files the policy selected.
    pub refused: bool,
}

/// A sweep in progress, or a finished one.
pub struct GcHandle {
    thread: Option<JoinHandle<Result<GcOutcome>>>,
    result: Option<Result<GcOutcome>>,
}

impl std::fmt::Debug for GcHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcHandle")
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl GcHandle {
    pub fn finished(result: Result<GcOutcome>) -> Self {
        Self {
            thread: None,
            result: Some(result),
        }
    }

    /// Run `sweep` on a background thread.
    pub fn spawn<F>(sweep: F) -> Result<Self>
    where
        F: FnOnce() -> Result<GcOutcome> + Send + 'static,
    {
        let thread = std::thread::Builder::new()
            .name("history-gc".into())
            .spawn(move || {
                let result = sweep();
                if let Err(err) = &result {
                    flog!(error, "History garbage collection failed:", err);
                }
                result
            })?;
        Ok(Self {
            thread: Some(thread),
            result: None,
        })
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Wait for the sweep and return its result.
    pub fn wait(self) -> Result<GcOutcome> {
        if let Some(result) = self.result {
            return result;
        }
        match self.thread.map(JoinHandle::join) {
            Some(Ok(result)) => result,
            _ => Err(HistoryError::Io(std::io::Error::other(
                "history gc thread panicked",
            ))),
        }
    }
}

/// Run `request` on the calling thread if `blocking`, else in the background.
pub fn spawn_gc(request: GcRequest, blocking: bool) -> Result<GcHandle> {
    if blocking {
        return Ok(GcHandle::finished(run_sweep(&request)));
    }
    GcHandle::spawn(move || run_sweep(&request))
}

/// One complete sweep.
pub fn run_sweep(request: &GcRequest) -> Result<GcOutcome> {
    if let Some(gate) = &request.startup {
        gate.wait();
    }
    let _profiler = TimeProfiler::new("gc");
    let now = now_secs();
    let candidates = enumerate_unlocked_session_files(&request.data_dir, now)?;
    let (empty, candidates): (Vec<GcCandidate>, Vec<GcCandidate>) =
        candidates.into_iter().partition(|c| c.file_size == 0);

    let HistorySize { limit, units } = request.size;
    let (amount, selected) = files_to_remove(request.size, &candidates, now);
    if let Some(last_size) = &request.last_size {
        *last_size.lock().unwrap_or_else(|e| e.into_inner()) =
            Some(HistorySize::new(amount + limit, units));
    }

    let mut outcome = GcOutcome {
        amount,
        ..Default::default()
    };
    let mut to_remove: Vec<PathBuf> = empty.into_iter().map(|c| c.path).collect();
    // An age cutoff never weighs what it removes against what it keeps.
    let guarded = units != SizeUnits::Seconds;
    if request.force || !guarded || amount < limit {
        to_remove.extend(selected);
    } else if !selected.is_empty() {
        outcome.refused = true;
        flog!(
            warning,
            format!(
                "History garbage collection would discard more history ({amount} {units}) than it would keep ({limit})."
            ),
            "Not removing any history for now. Either increase your limit (XONSH_HISTORY_SIZE), or run `history gc --force`."
        );
    }

    outcome.removed = remove_files(&to_remove);
    flogf!(
        history_gc,
        "Removed {} of {} history files",
        outcome.removed.len(),
        candidates.len()
    );
    Ok(outcome)
}

/// Delete `paths`, returning those that are now gone.
fn remove_files(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut removed = Vec::with_capacity(paths.len());
    for path in paths {
        match std::fs::remove_file(path) {
            Ok(()) => removed.push(path.clone()),
            Err(err) if err.kind() == ErrorKind::NotFound => removed.push(path.clone()),
            Err(err) => {
                let err = HistoryError::GcFile {
                    path: path.clone(),
                    source: err,
                };
                flog!(history_gc, err);
            }
        }
    }
    removed
}

/// Dispatch to the policy for the budget's units. Returns the amount that would be removed
/// and the files to remove.
pub fn files_to_remove(size: HistorySize, files: &[GcCandidate], now: f64) -> (f64, Vec<PathBuf>) {
    match size.units {
        SizeUnits::Commands => gc_commands_to_remove(size.limit, files),
        SizeUnits::Files => gc_files_to_remove(size.limit, files),
        SizeUnits::Seconds => gc_seconds_to_remove(size.limit, files, now),
        SizeUnits::Bytes => gc_bytes_to_remove(size.limit, files),
    }
}

/// Count how many of the newest files fit in `limit`, measured by `weight`.
fn newest_that_fit(limit: f64, files: &[GcCandidate], weight: fn(&GcCandidate) -> f64) -> usize {
    let mut total = 0.0;
    let mut kept = 0;
    for file in files.iter().rev() {
        let w = weight(file);
        if total + w > limit {
            break;
        }
        total += w;
        kept += 1;
    }
    kept
}

fn paths(files: &[GcCandidate]) -> Vec<PathBuf> {
    files.iter().map(|f| f.path.clone()).collect()
}

/// Files are sorted oldest first.
pub fn gc_commands_to_remove(limit: f64, files: &[GcCandidate]) -> (f64, Vec<PathBuf>) {
    let kept = newest_that_fit(limit, files, |f| f.command_count as f64);
    let (old, newer) = files.split_at(files.len() - kept);
    let removed: usize = old.iter().map(|f| f.command_count).sum();
    let mut remove = paths(old);
    // Sessions without commands never need to be kept.
    remove.extend(
        newer
            .iter()
            .filter(|f| f.command_count == 0)
            .map(|f| f.path.clone()),
    );
    (removed as f64, remove)
}

pub fn gc_files_to_remove(limit: f64, files: &[GcCandidate]) -> (f64, Vec<PathBuf>) {
    let keep = limit.max(0.0) as usize;
    if files.len() <= keep {
        return (0.0, vec![]);
    }
    let old = &files[..files.len() - keep];
    (old.len() as f64, paths(old))
}

pub fn gc_bytes_to_remove(limit: f64, files: &[GcCandidate]) -> (f64, Vec<PathBuf>) {
    let kept = newest_that_fit(limit, files, |f| f.file_size as f64);
    let old = &files[..files.len() - kept];
    let removed: u64 = old.iter().map(|f| f.file_size).sum();
    (removed as f64, paths(old))
}

/// The amount is the age of the oldest file, if anything is removed.
pub fn gc_seconds_to_remove(limit: f64, files: &[GcCandidate], now: f64) -> (f64, Vec<PathBuf>) {
    let n = files
        .iter()
        .take_while(|f| now - f.closed_at >= limit)
        .count();
    if n == 0 {
        return (0.0, vec![]);
    }
    (now - files[0].closed_at, paths(&files[..n]))
}

/// List the closed session files in `data_dir`, oldest first. Empty files count as closed
/// now with no commands. Unreadable files are skipped.
pub fn enumerate_unlocked_session_files(data_dir: &Path, now: f64) -> Result<Vec<GcCandidate>> {
    let entries = std::fs::read_dir(data_dir).map_err(|source| HistoryError::DataDirMissing {
        path: data_dir.to_owned(),
        source,
    })?;
    let boot = boot_time();
    let mut candidates = vec![];
    for entry in entries.flatten() {
        let name = entry.file_name();
        if !name.to_str().is_some_and(is_session_file_name) {
            continue;
        }
        let path = entry.path();
        match inspect_session_file(&path, now, boot) {
            Ok(Some(candidate)) => candidates.push(candidate),
            Ok(None) => {}
            Err(err) => flog!(history_gc, "Skipping", path.display(), "-", err),
        }
    }
    Ok(candidates
        .into_iter()
        .sorted_by(|a, b| {
            a.closed_at
                .total_cmp(&b.closed_at)
                .then(a.command_count.cmp(&b.command_count))
                .then_with(|| a.path.cmp(&b.path))
        })
        .collect())
}

/// Describe one session file, or None if it is still in use.
fn inspect_session_file(path: &Path, now: f64, boot: Option<f64>) -> Result<Option<GcCandidate>> {
    let file_size = std::fs::metadata(path)?.len();
    if file_size == 0 {
        return Ok(Some(GcCandidate {
            closed_at: now,
            command_count: 0,
            path: path.to_owned(),
            file_size,
        }));
    }

    let mut root = LazyNode::open(path)?;
    let mut locked = root.load_key("locked").ok().and_then(|v| v.as_bool()) == Some(true);
    let ts = root.load_key("ts").unwrap_or(JsonValue::Null);
    if locked && boot.is_some_and(|boot| ts[0].as_f64().is_some_and(|start| start < boot)) {
        // The machine rebooted since this session started, so its shell is gone.
        unlock_session_file(path, &root)?;
        root = LazyNode::open(path)?;
        locked = false;
    }
    if locked {
        return Ok(None);
    }

    let command_count = match root.get("cmds")? {
        LazyValue::Node(cmds) => cmds.len(),
        LazyValue::Value(_) => {
            return Err(HistoryError::InvalidFormat("cmds is not a list".into()));
        }
    };
    let closed_at = ts[1].as_f64().or_else(|| ts[0].as_f64()).unwrap_or(0.0);
    Ok(Some(GcCandidate {
        closed_at,
        command_count,
        path: path.to_owned(),
        file_size,
    }))
}

fn unlock_session_file(path: &Path, root: &LazyNode) -> Result<()> {
    flog!(history_gc, "Unlocking", path.display(), "left locked before the last reboot");
    let mut doc = root.load()?;
    doc["locked"] = false.into();
    rewrite_via_temporary_file(path, |out| lazy_json::dump(&doc, out, true))?;
    Ok(())
}
