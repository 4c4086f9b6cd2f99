//! The ordered flush queue.
//!
//! Every operation that touches a session file, whether a write of buffered commands or a
//! lazy read of an already flushed one, is a job on a single FIFO queue drained by one worker
//! thread. Jobs therefore apply in exactly the order they were enqueued, and a read always
//! observes every write enqueued before it.
//!
//! A write that fails is not dropped. It stays at the head of the queue and is retried, and
//! every caller waiting on it or on a later job is told about the failure. Dropping it would
//! let later writes land ahead of it.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use json::JsonValue;

use crate::error::{HistoryError, Result};
use crate::flog::{flog, flogf};
use crate::history::file::{now_secs, rewrite_via_temporary_file};
use crate::history::history::TimeProfiler;
use crate::history::lazy_json::{self, LazyNode};

/// How long the worker waits before retrying a failed write.
pub const FLUSH_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// One write to a session file: the entries buffered at the time the flush was started.
#[derive(Debug)]
pub struct WriteUnit {
    pub path: PathBuf,
    /// Serialized entries, snapshotted when the flush was initiated.
    pub entries: Vec<JsonValue>,
    /// Mark the session closed: set its end time and clear its lock.
    pub at_exit: bool,
    /// Discard all stored entries before appending.
    pub reset: bool,
}

impl WriteUnit {
    pub fn append(path: PathBuf, entries: Vec<JsonValue>, at_exit: bool) -> Self {
        Self {
            path,
            entries,
            at_exit,
            reset: false,
        }
    }

    pub fn reset(path: PathBuf) -> Self {
        Self {
            path,
            entries: Vec::new(),
            at_exit: false,
            reset: true,
        }
    }

    /// Load the whole session file, merge in our entries, and write it back.
    fn apply(&self) -> std::io::Result<()> {
        let _profiler = TimeProfiler::new("flush");
        let mut doc = load_document(&self.path)?;
        if self.reset {
            doc["cmds"] = JsonValue::new_array();
        }
        for entry in &self.entries {
            doc["cmds"].push(entry.clone()).map_err(invalid_data)?;
        }
        if self.at_exit {
            doc["ts"][1] = now_secs().into();
            doc["locked"] = false.into();
        }
        rewrite_via_temporary_file(&self.path, |out| lazy_json::dump(&doc, out, true))?;
        flogf!(
            history,
            "Wrote {} commands to {}{}",
            self.entries.len(),
            self.path.display(),
            if self.at_exit { " and closed the session" } else { "" }
        );
        Ok(())
    }
}

fn invalid_data(err: impl std::fmt::Display) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, err.to_string())
}

fn load_document(path: &Path) -> std::io::Result<JsonValue> {
    let doc = LazyNode::open(path).and_then(|root| root.load());
    match doc {
        Ok(doc) if doc["cmds"].is_array() => Ok(doc),
        Ok(_) => Err(invalid_data("session file has no command list")),
        Err(HistoryError::Io(err)) => Err(err),
        Err(err) => Err(invalid_data(err)),
    }
}

enum Job {
    Write(WriteUnit),
    Read(Box<dyn FnOnce() + Send>),
}

struct QueueState {
    jobs: VecDeque<(u64, Job)>,
    next_ticket: u64,
    /// Every job with a smaller ticket has finished.
    completed: u64,
    /// Set while the job at the head of the queue keeps failing.
    failure: Option<HistoryError>,
    shutdown: bool,
    /// The worker has exited.
    stopped: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    cond: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A pending job. Dropping the handle does not cancel the job.
#[derive(Clone)]
pub struct FlushHandle {
    shared: Arc<Shared>,
    ticket: u64,
}

impl std::fmt::Debug for FlushHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlushHandle")
            .field("ticket", &self.ticket)
            .finish()
    }
}

impl FlushHandle {
    /// Returns whether the job has been applied.
    pub fn is_done(&self) -> bool {
        self.shared.lock().completed > self.ticket
    }

    /// Block until the job has been applied. If the queue is stuck behind a failing write
    /// (this job's or an earlier one), the failure is returned instead.
    pub fn wait(&self) -> Result<()> {
        let mut state = self.shared.lock();
        loop {
            if state.completed > self.ticket {
                return Ok(());
            }
            if let Some(failure) = state.failure.as_ref().and_then(|f| f.clone_flush_failure()) {
                return Err(failure);
            }
            if state.stopped {
                return Err(HistoryError::Io(std::io::Error::other(
                    "history flush queue stopped before the job ran",
                )));
            }
            state = self.shared.cond.wait(state).unwrap_or_else(|e| e.into_inner());
        }
    }
}

/// The queue and its worker thread.
pub struct FlushQueue {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl FlushQueue {
    pub fn new() -> Result<Self> {
        Self::with_retry_interval(FLUSH_RETRY_INTERVAL)
    }

    pub fn with_retry_interval(retry_interval: Duration) -> Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                jobs: VecDeque::new(),
                next_ticket: 0,
                completed: 0,
                failure: None,
                shutdown: false,
                stopped: false,
            }),
            cond: Condvar::new(),
        });
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("history-flush".into())
            .spawn(move || run_worker(&worker_shared, retry_interval))?;
        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    fn enqueue(&self, job: Job) -> Result<FlushHandle> {
        let mut state = self.shared.lock();
        if state.shutdown {
            return Err(HistoryError::Io(std::io::Error::other(
                "history flush queue is shut down",
            )));
        }
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.jobs.push_back((ticket, job));
        self.shared.cond.notify_all();
        Ok(FlushHandle {
            shared: Arc::clone(&self.shared),
            ticket,
        })
    }

    /// Enqueue a write. Returns as soon as the job is queued.
    pub fn write(&self, unit: WriteUnit) -> Result<FlushHandle> {
        self.enqueue(Job::Write(unit))
    }

    /// Run `read` in its turn on the worker and wait for its result.
    pub fn read<T, F>(&self, read: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(1);
        let handle = self.enqueue(Job::Read(Box::new(move || {
            let _ = tx.send(read());
        })))?;
        handle.wait()?;
        rx.recv().map_err(|_| {
            HistoryError::Io(std::io::Error::other("history read job did not run"))
        })?
    }

    /// Number of jobs not yet finished, including one in progress.
    pub fn pending(&self) -> usize {
        let state = self.shared.lock();
        (state.next_ticket - state.completed) as usize
    }

    /// Stop accepting jobs, let the worker drain what is queued, and join it. A worker stuck on
    /// a failing write gives up instead of draining.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.lock();
            state.shutdown = true;
            self.shared.cond.notify_all();
        }
        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                flog!(error, "History flush worker panicked");
            }
        }
    }
}

impl Drop for FlushQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(shared: &Shared, retry_interval: Duration) {
    loop {
        let (ticket, job) = {
            let mut state = shared.lock();
            loop {
                if let Some(front) = state.jobs.pop_front() {
                    break front;
                }
                if state.shutdown {
                    state.stopped = true;
                    shared.cond.notify_all();
                    return;
                }
                state = shared.cond.wait(state).unwrap_or_else(|e| e.into_inner());
            }
        };

        match job {
            Job::Read(read) => read(),
            Job::Write(unit) => {
                if !write_until_done(shared, &unit, retry_interval) {
                    let mut state = shared.lock();
                    state.stopped = true;
                    shared.cond.notify_all();
                    return;
                }
            }
        }

        let mut state = shared.lock();
        state.completed = ticket + 1;
        state.failure = None;
        shared.cond.notify_all();
    }
}

/// Apply `unit`, retrying on failure. Returns false if the queue was shut down while the
/// write was still failing.
fn write_until_done(shared: &Shared, unit: &WriteUnit, retry_interval: Duration) -> bool {
    loop {
        let err = match unit.apply() {
            Ok(()) => return true,
            Err(err) => err,
        };
        flog!(
            error,
            "Failed to write history to",
            unit.path.display(),
            "- retrying:",
            err
        );
        let mut state = shared.lock();
        state.failure = Some(HistoryError::flush_failure(&unit.path, err));
        shared.cond.notify_all();
        if state.shutdown {
            flog!(
                error,
                "Giving up on history for",
                unit.path.display(),
                "with",
                state.jobs.len() + 1,
                "unwritten flushes"
            );
            return false;
        }
        let (state, _) = shared
            .cond
            .wait_timeout(state, retry_interval)
            .unwrap_or_else(|e| e.into_inner());
        if state.shutdown {
            flog!(history, "Shutting down with a failing history write pending");
            return false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{FlushQueue, WriteUnit};
    use crate::error::HistoryError;
    use crate::history::lazy_json::{self, LazyNode};
    use assert_matches::assert_matches;
    use json::{JsonValue, array, object};
    use rand::Rng;
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn write_session(path: &Path) {
        let doc = object! {"cmds": [], "locked": true, "sessionid": "t", "ts": [1.0, null]};
        std::fs::write(path, lazy_json::dumps(&doc, true)).unwrap();
    }

    fn entry(inp: &str) -> JsonValue {
        object! {"inp": inp, "rtn": 0, "ts": [1.0, 2.0]}
    }

    fn stored_inputs(path: &Path) -> Vec<String> {
        let doc = LazyNode::open(path).unwrap().load().unwrap();
        doc["cmds"]
            .members()
            .map(|c| c["inp"].as_str().unwrap().to_owned())
            .collect()
    }

    #[test]
    fn test_jobs_run_in_enqueue_order() {
        let queue = FlushQueue::new().unwrap();
        let order = Arc::new(Mutex::new(vec![]));
        let mut handles = vec![];
        for i in 0..20 {
            let order = Arc::clone(&order);
            let job = super::Job::Read(Box::new(move || {
                let delay = rand::rng().random_range(0..3);
                std::thread::sleep(Duration::from_millis(delay));
                order.lock().unwrap().push(i);
            }));
            handles.push(queue.enqueue(job).unwrap());
        }
        for handle in handles.iter().rev() {
            handle.wait().unwrap();
        }
        assert!(handles.iter().all(|h| h.is_done()));
        assert_eq!(*order.lock().unwrap(), (0..20).collect::<Vec<_>>());
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn test_writes_append_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("xonsh-t.json");
        write_session(&path);
        let queue = FlushQueue::new().unwrap();
        let mut rng = rand::rng();
        let mut expected = vec![];
        let mut last = None;
        for batch in 0..8 {
            let mut entries = vec![];
            for i in 0..rng.random_range(1..5) {
                let inp = format!("cmd {batch}.{i}");
                entries.push(entry(&inp));
                expected.push(inp);
            }
            last = Some(queue.write(WriteUnit::append(path.clone(), entries, false)).unwrap());
            std::thread::sleep(Duration::from_millis(rng.random_range(0..3)));
        }
        last.unwrap().wait().unwrap();
        assert_eq!(stored_inputs(&path), expected);
    }

    #[test]
    fn test_reads_see_earlier_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("xonsh-t.json");
        write_session(&path);
        let queue = FlushQueue::new().unwrap();
        queue
            .write(WriteUnit::append(path.clone(), vec![entry("ls")], false))
            .unwrap();
        let read_path = path.clone();
        let inp = queue
            .read(move || {
                let root = LazyNode::open(&read_path)?;
                let crate::history::lazy_json::LazyValue::Node(cmds) = root.get("cmds")? else {
                    unreachable!()
                };
                cmds.index(0)?.load()
            })
            .unwrap();
        assert_eq!(inp["inp"], "ls");
    }

    #[test]
    fn test_at_exit_closes_session() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("xonsh-t.json");
        write_session(&path);
        let queue = FlushQueue::new().unwrap();
        queue
            .write(WriteUnit::append(path.clone(), vec![], true))
            .unwrap()
            .wait()
            .unwrap();
        let doc = LazyNode::open(&path).unwrap().load().unwrap();
        assert_eq!(doc["locked"], false);
        assert!(doc["ts"][1].as_f64().unwrap() >= doc["ts"][0].as_f64().unwrap());
    }

    #[test]
    fn test_reset_clears_commands() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("xonsh-t.json");
        write_session(&path);
        let queue = FlushQueue::new().unwrap();
        queue
            .write(WriteUnit::append(path.clone(), vec![entry("a"), entry("b")], false))
            .unwrap();
        queue
            .write(WriteUnit::reset(path.clone()))
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(stored_inputs(&path), Vec::<String>::new());
        let doc = LazyNode::open(&path).unwrap().load().unwrap();
        assert_eq!(doc["cmds"], array![]);
    }

    #[test]
    fn test_failed_write_blocks_later_jobs_until_it_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("xonsh-late.json");
        let queue = FlushQueue::with_retry_interval(Duration::from_millis(10)).unwrap();

        // The session file does not exist yet, so this write fails and is retried.
        let first = queue
            .write(WriteUnit::append(path.clone(), vec![entry("first")], false))
            .unwrap();
        let second = queue
            .write(WriteUnit::append(path.clone(), vec![entry("second")], false))
            .unwrap();
        assert_matches!(first.wait(), Err(HistoryError::FlushWriteFailure { .. }));
        assert_matches!(second.wait(), Err(HistoryError::FlushWriteFailure { .. }));
        assert!(!second.is_done());

        write_session(&path);
        while !second.is_done() {
            std::thread::sleep(Duration::from_millis(5));
        }
        first.wait().unwrap();
        second.wait().unwrap();
        assert_eq!(stored_inputs(&path), ["first", "second"]);
    }

    #[test]
    fn test_shutdown_drains_queue() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("xonsh-t.json");
        write_session(&path);
        let queue = FlushQueue::new().unwrap();
        for i in 0..5 {
            queue
                .write(WriteUnit::append(path.clone(), vec![entry(&i.to_string())], false))
                .unwrap();
        }
        queue.shutdown();
        assert_eq!(stored_inputs(&path), ["0", "1", "2", "3", "4"]);
        assert!(queue.write(WriteUnit::reset(path.clone())).is_err());
    }

    #[test]
    fn test_shutdown_gives_up_on_failing_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("xonsh-t.json");
        let queue = FlushQueue::with_retry_interval(Duration::from_millis(10)).unwrap();
        let handle = queue
            .write(WriteUnit::append(path, vec![entry("lost")], false))
            .unwrap();
        assert!(handle.wait().is_err());
        queue.shutdown();
        assert!(handle.wait().is_err());
        assert!(!handle.is_done());
    }
}
