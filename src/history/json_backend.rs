//! The default backend: one indexed JSON file per session.
//!
//! Commands are buffered in memory and handed to the flush queue in batches. Reads of commands
//! that have already left the buffer go through the same queue, so they see every earlier
//! flush and never a file that is being rewritten.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use itertools::Itertools;
use json::JsonValue;

use crate::config::{BackendKind, HistoryConfig, HistorySize};
use crate::error::{HistoryError, Result};
use crate::flog::{flog, flogf};
use crate::history::file::{
    is_session_file_name, new_session_id, now_secs, rewrite_via_temporary_file,
    session_file_path,
};
use crate::history::flusher::{FlushHandle, FlushQueue, WriteUnit};
use crate::history::gc::{GcHandle, GcRequest, LastGcSize, StartupGate, spawn_gc};
use crate::history::history::{
    CommandEntry, EntryField, HistoryBackend, HistoryItem, HistorySlice, IgnorePolicy,
    TimeProfiler, TimestampSpan, normalize_index,
};
use crate::history::lazy_json::{self, LazyNode, LazyValue};

pub struct JsonHistory {
    session_id: String,
    path: PathBuf,
    data_dir: PathBuf,
    /// Commands not yet handed to the flush queue, oldest first.
    buffer: Vec<CommandEntry>,
    buffer_size: usize,
    /// Commands recorded in this session, flushed or not.
    len: usize,
    last_input: Option<String>,
    policy: IgnorePolicy,
    store_stdout: bool,
    save_cwd: bool,
    remember: bool,
    history_size: HistorySize,
    last_gc_size: LastGcSize,
    startup: Arc<StartupGate>,
    queue: FlushQueue,
}

impl JsonHistory {
    pub fn new(config: &HistoryConfig) -> Result<Self> {
        Self::with_metadata(config, JsonValue::new_object())
    }

    /// Create a session whose file header also carries the fields of `metadata`.
    pub fn with_metadata(config: &HistoryConfig, metadata: JsonValue) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir).map_err(|source| {
            HistoryError::DataDirMissing {
                path: config.data_dir.clone(),
                source,
            }
        })?;
        let session_id = new_session_id();
        let path = match &config.history_file {
            Some(path) => path.clone(),
            None => session_file_path(&config.data_dir, &session_id),
        };

        let mut header = if metadata.is_object() {
            metadata
        } else {
            JsonValue::new_object()
        };
        header["cmds"] = JsonValue::new_array();
        header["sessionid"] = session_id.as_str().into();
        header["ts"] = TimestampSpan::new(now_secs(), None).to_json();
        header["locked"] = true.into();
        if let Some(env) = &config.environment {
            let mut obj = JsonValue::new_object();
            for (name, value) in env {
                obj[name.as_str()] = value.as_str().into();
            }
            header["env"] = obj;
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        rewrite_via_temporary_file(&path, |out| lazy_json::dump(&header, out, true))?;
        flog!(history_file, "Created session file", path.display());

        Ok(Self {
            session_id,
            path,
            data_dir: config.data_dir.clone(),
            buffer: Vec::with_capacity(config.buffer_size),
            buffer_size: config.buffer_size.max(1),
            len: 0,
            last_input: None,
            policy: IgnorePolicy::from_config(config),
            store_stdout: config.store_stdout,
            save_cwd: config.save_cwd,
            remember: true,
            history_size: config.history_size,
            last_gc_size: Arc::new(Mutex::new(None)),
            startup: StartupGate::new(),
            queue: FlushQueue::new()?,
        })
    }

    pub fn inputs(&self) -> FieldView<'_> {
        self.view(EntryField::Input)
    }

    pub fn return_codes(&self) -> FieldView<'_> {
        self.view(EntryField::ReturnCode)
    }

    pub fn outputs(&self) -> FieldView<'_> {
        self.view(EntryField::Output)
    }

    pub fn timestamps(&self) -> FieldView<'_> {
        self.view(EntryField::Timestamp)
    }

    pub fn view(&self, field: EntryField) -> FieldView<'_> {
        FieldView {
            history: self,
            field,
        }
    }

    /// How many commands are already in the flush queue or on disk.
    fn flushed_len(&self) -> usize {
        self.len - self.buffer.len()
    }

    /// Fetch entries (or one field of them) at `indices`, preserving their order.
    fn fetch(&self, indices: &[usize], field: Option<EntryField>) -> Result<Vec<JsonValue>> {
        let flushed = self.flushed_len();
        let on_disk: Vec<usize> = indices.iter().copied().filter(|&k| k < flushed).collect();
        let from_disk = if on_disk.is_empty() {
            vec![]
        } else {
            let path = self.path.clone();
            self.queue
                .read(move || read_flushed(&path, &on_disk, field))?
        };
        let mut from_disk = from_disk.into_iter();

        let mut values = Vec::with_capacity(indices.len());
        for &k in indices {
            let value = if k < flushed {
                from_disk.next().ok_or_else(|| {
                    HistoryError::InvalidFormat("session file is missing commands".into())
                })?
            } else {
                let entry = self.buffer[k - flushed].to_json();
                match field {
                    Some(field) => field.of(&entry),
                    None => entry,
                }
            };
            values.push(value);
        }
        Ok(values)
    }

    fn gc_request(&self, size: Option<HistorySize>, force: bool) -> GcRequest {
        GcRequest {
            data_dir: self.data_dir.clone(),
            size: size.unwrap_or(self.history_size),
            force,
            startup: None,
            last_size: Some(Arc::clone(&self.last_gc_size)),
        }
    }
}

/// Read entries of a session file's `cmds` list. A missing field reads as null.
fn read_flushed(path: &Path, indices: &[usize], field: Option<EntryField>) -> Result<Vec<JsonValue>> {
    let _profiler = TimeProfiler::new("read_flushed");
    let cmds = match LazyNode::open(path)?.get("cmds")? {
        LazyValue::Node(cmds) => cmds,
        LazyValue::Value(_) => return Err(HistoryError::InvalidFormat("cmds is not a list".into())),
    };
    if indices.len() >= cmds.len() {
        // Every command is wanted, so read the list in one go.
        let all = cmds.load()?;
        return indices
            .iter()
            .map(|&k| {
                if k >= all.len() {
                    return Err(HistoryError::IndexOutOfRange {
                        index: k as isize,
                        len: all.len(),
                    });
                }
                Ok(field.map_or_else(|| all[k].clone(), |field| field.of(&all[k])))
            })
            .collect();
    }
    indices
        .iter()
        .map(|&k| match (cmds.index(k)?, field) {
            (entry, None) => entry.load(),
            (LazyValue::Node(entry), Some(field)) => match entry.get(field.key()) {
                Ok(value) => value.load(),
                Err(HistoryError::KeyNotFound(_)) => Ok(JsonValue::Null),
                Err(err) => Err(err),
            },
            (LazyValue::Value(_), Some(_)) => {
                Err(HistoryError::InvalidFormat(format!("command {k} is not an object")))
            }
        })
        .collect()
}

/// Load every command of a closed session file.
fn load_session_items(path: &Path) -> Result<Vec<HistoryItem>> {
    let root = LazyNode::open(path)?;
    let session_id = root.load_key("sessionid").ok();
    let session_id = session_id.as_ref().and_then(JsonValue::as_str);
    let cmds = root.load_key("cmds")?;
    cmds.members()
        .map(|cmd| CommandEntry::from_json(cmd).map(|e| HistoryItem::from_entry(&e, session_id)))
        .collect()
}

/// One field of every command in a session, addressed like a list.
pub struct FieldView<'a> {
    history: &'a JsonHistory,
    field: EntryField,
}

impl FieldView<'_> {
    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: isize) -> Result<JsonValue> {
        let k = normalize_index(index, self.len())?;
        let mut values = self.history.fetch(&[k], Some(self.field))?;
        Ok(values.pop().unwrap_or(JsonValue::Null))
    }

    pub fn slice(&self, slice: HistorySlice) -> Result<Vec<JsonValue>> {
        let indices = slice.indices(self.len())?;
        self.history.fetch(&indices, Some(self.field))
    }
}

impl HistoryBackend for JsonHistory {
    fn kind(&self) -> BackendKind {
        BackendKind::Json
    }

    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn file(&self) -> Option<&Path> {
        Some(&self.path)
    }

    fn append(&mut self, mut entry: CommandEntry) -> Result<Option<FlushHandle>> {
        if !self.remember {
            return Ok(None);
        }
        if self.policy.should_ignore(&entry, self.last_input.as_deref()) {
            flog!(history, "Not recording", entry.input.trim_end());
            return Ok(None);
        }
        if !self.store_stdout {
            entry.output = None;
        }
        if !self.save_cwd {
            entry.cwd = None;
        }
        self.last_input = Some(entry.input.clone());
        self.buffer.push(entry);
        self.len += 1;
        if self.buffer.len() >= self.buffer_size {
            return self.flush(false);
        }
        Ok(None)
    }

    fn flush(&mut self, at_exit: bool) -> Result<Option<FlushHandle>> {
        if self.buffer.is_empty() && !at_exit {
            return Ok(None);
        }
        let entries = std::mem::take(&mut self.buffer)
            .iter()
            .map(CommandEntry::to_json)
            .collect_vec();
        flogf!(
            history,
            "Flushing {} commands to {}",
            entries.len(),
            self.path.display()
        );
        let handle = self
            .queue
            .write(WriteUnit::append(self.path.clone(), entries, at_exit))?;
        if at_exit {
            handle.wait()?;
        }
        Ok(Some(handle))
    }

    fn items(&self, newest_first: bool) -> Result<Vec<HistoryItem>> {
        let mut items: Vec<HistoryItem> = self
            .slice(HistorySlice::ALL)?
            .iter()
            .map(|entry| HistoryItem::from_entry(entry, Some(&self.session_id)))
            .collect();
        if newest_first {
            items.reverse();
        }
        Ok(items)
    }

    fn all_items(&self, newest_first: bool) -> Result<Vec<HistoryItem>> {
        let entries = std::fs::read_dir(&self.data_dir).map_err(|source| {
            HistoryError::DataDirMissing {
                path: self.data_dir.clone(),
                source,
            }
        })?;
        let files = entries
            .flatten()
            .filter(|entry| entry.file_name().to_str().is_some_and(is_session_file_name))
            .map(|entry| entry.path())
            .filter(|path| *path != self.path)
            .filter_map(|path| {
                let mtime = std::fs::metadata(&path).and_then(|m| m.modified()).ok()?;
                Some((mtime, path))
            })
            .sorted_by_key(|(mtime, _): &(SystemTime, PathBuf)| *mtime);

        let mut items = vec![];
        for (_, path) in files {
            match load_session_items(&path) {
                Ok(session) => items.extend(session),
                Err(err) => flog!(history_file, "Skipping", path.display(), "-", err),
            }
        }
        items.extend(self.items(false)?);
        if newest_first {
            items.reverse();
        }
        Ok(items)
    }

    fn run_gc(&self, size: Option<HistorySize>, blocking: bool, force: bool) -> Result<GcHandle> {
        spawn_gc(self.gc_request(size, force), blocking)
    }

    fn start_gc(&self) -> Result<()> {
        let mut request = self.gc_request(None, false);
        request.startup = Some(Arc::clone(&self.startup));
        // Detached; the sweep reports its own failures.
        spawn_gc(request, false).map(drop)
    }

    fn startup_finished(&self) {
        self.startup.open();
    }

    fn info(&self) -> Vec<(&'static str, String)> {
        let last_size = self
            .last_gc_size
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .map_or_else(|| "?".to_owned(), |size| size.to_string());
        vec![
            ("backend", self.kind().name().to_owned()),
            ("sessionid", self.session_id.clone()),
            ("filename", self.path.display().to_string()),
            ("length", self.len().to_string()),
            ("buffersize", self.buffer_size.to_string()),
            ("bufferlength", self.buffer.len().to_string()),
            ("gc options", self.history_size.to_string()),
            ("gc_last_size", last_size),
        ]
    }

    fn len(&self) -> usize {
        if self.remember { self.len } else { 0 }
    }

    fn get(&self, index: isize) -> Result<CommandEntry> {
        let k = normalize_index(index, self.len())?;
        let mut values = self.fetch(&[k], None)?;
        CommandEntry::from_json(&values.pop().unwrap_or(JsonValue::Null))
    }

    fn slice(&self, slice: HistorySlice) -> Result<Vec<CommandEntry>> {
        let indices = slice.indices(self.len())?;
        self.fetch(&indices, None)?
            .iter()
            .map(CommandEntry::from_json)
            .collect()
    }

    fn field(&self, field: EntryField, slice: HistorySlice) -> Result<Vec<JsonValue>> {
        self.view(field).slice(slice)
    }

    fn clear(&mut self) -> Result<()> {
        self.buffer.clear();
        self.len = 0;
        self.last_input = None;
        self.queue.write(WriteUnit::reset(self.path.clone()))?.wait()
    }

    fn set_remember(&mut self, remember: bool) {
        self.remember = remember;
    }

    fn remember(&self) -> bool {
        self.remember
    }
}

#[cfg(test)]
mod tests {
    use super::{JsonHistory, read_flushed};
    use crate::config::{HistControl, HistoryConfig, HistorySize, SizeUnits};
    use crate::error::HistoryError;
    use crate::history::file::now_secs;
    use crate::history::history::{
        CommandEntry, EntryField, HistoryBackend, HistorySlice, TimestampSpan,
    };
    use crate::history::lazy_json::{self, LazyNode};
    use assert_matches::assert_matches;
    use json::{JsonValue, object};
    use rand::Rng;
    use std::collections::BTreeMap;
    use std::path::Path;
    use std::time::Duration;

    fn entry(input: &str, rtn: i32) -> CommandEntry {
        let now = now_secs();
        CommandEntry::new(input, Some(rtn), TimestampSpan::new(now, Some(now)))
    }

    fn config(dir: &Path, buffer_size: usize) -> HistoryConfig {
        let mut config = HistoryConfig::new(dir);
        config.buffer_size = buffer_size;
        config
    }

    fn load(path: &Path) -> JsonValue {
        LazyNode::open(path).unwrap().load().unwrap()
    }

    #[test]
    fn test_new_session_header() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path(), 100);
        config.environment = Some(BTreeMap::from([("PATH".into(), "/bin".into())]));
        let hist = JsonHistory::with_metadata(&config, object! {"shell": "xonsh"}).unwrap();
        let path = hist.file().unwrap();
        assert_eq!(path.parent(), Some(dir.path()));
        let doc = load(path);
        assert_eq!(doc["sessionid"], hist.session_id());
        assert_eq!(doc["locked"], true);
        assert_eq!(doc["cmds"].len(), 0);
        assert!(doc["ts"][0].as_f64().is_some());
        assert!(doc["ts"][1].is_null());
        assert_eq!(doc["env"]["PATH"], "/bin");
        assert_eq!(doc["shell"], "xonsh");
    }

    #[test]
    fn test_explicit_history_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path(), 100);
        let file = dir.path().join("nested").join("mine.json");
        config.history_file = Some(file.clone());
        let hist = JsonHistory::new(&config).unwrap();
        assert_eq!(hist.file(), Some(file.as_path()));
        assert!(file.exists());
    }

    #[test]
    fn test_return_codes() {
        // With a buffer of one every command is read back from the file.
        for buffer_size in [1, 100] {
            let dir = tempfile::tempdir().unwrap();
            let mut hist = JsonHistory::new(&config(dir.path(), buffer_size)).unwrap();
            hist.append(entry("false", 1)).unwrap();
            hist.append(entry("true", 0)).unwrap();
            let rtns = hist.return_codes();
            assert_eq!(rtns.len(), 2);
            assert_eq!(rtns.get(-1).unwrap(), 0);
            assert_eq!(rtns.slice(HistorySlice::ALL).unwrap(), [1, 0]);
            assert_matches!(rtns.get(2), Err(HistoryError::IndexOutOfRange { .. }));
        }
    }

    #[test]
    fn test_ignoredups() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path(), 100);
        config.hist_control = HistControl::IGNORE_DUPS;
        let mut hist = JsonHistory::new(&config).unwrap();
        for input in ["ls", "ls", "ls foo"] {
            hist.append(entry(input, 0)).unwrap();
        }
        assert_eq!(hist.len(), 2);
        assert_eq!(hist.inputs().get(-1).unwrap(), "ls foo");
    }

    #[test]
    fn test_ignore_err_space_and_regex() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path(), 100);
        config.hist_control = HistControl::IGNORE_ERR | HistControl::IGNORE_SPACE;
        config.ignore_regex = Some(regex::Regex::new("^(export|secret)").unwrap());
        let mut hist = JsonHistory::new(&config).unwrap();
        let mut spaced = entry("echo hidden", 0);
        spaced.space_prefixed = true;
        for e in [entry("false", 1), spaced, entry("export TOKEN=1", 0), entry("echo ok", 0)] {
            assert!(hist.append(e).unwrap().is_none());
        }
        assert_eq!(hist.len(), 1);
        assert_eq!(hist.inputs().slice(HistorySlice::ALL).unwrap(), ["echo ok"]);
    }

    #[test]
    fn test_buffer_flushes_and_lazy_reads() {
        let dir = tempfile::tempdir().unwrap();
        let mut hist = JsonHistory::new(&config(dir.path(), 3)).unwrap();
        let mut handles = vec![];
        for i in 0..7 {
            if let Some(handle) = hist.append(entry(&format!("echo {i}"), i)).unwrap() {
                handles.push(handle);
            }
        }
        assert_eq!(handles.len(), 2);
        assert_eq!(hist.len(), 7);
        for handle in &handles {
            handle.wait().unwrap();
        }
        assert_eq!(load(hist.file().unwrap())["cmds"].len(), 6);

        for i in 0..7 {
            let e = hist.get(i).unwrap();
            assert_eq!(e.input, format!("echo {i}"));
            assert_eq!(e.return_code, Some(i as i32));
        }
        let inputs = hist.inputs().slice("::-3".parse().unwrap()).unwrap();
        assert_eq!(inputs, ["echo 6", "echo 3", "echo 0"]);
        let stamps = hist.timestamps().slice("-2:".parse().unwrap()).unwrap();
        assert_eq!(stamps.len(), 2);
        assert!(stamps.iter().all(|ts| ts[0].as_f64().is_some()));
    }

    #[test]
    fn test_read_flushed_whole_list_and_single_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("xonsh-s.json");
        let doc = object! {
            "cmds": [{"inp": "a", "rtn": 0}, {"inp": "b"}, {"inp": "c", "rtn": 2}],
            "sessionid": "s",
        };
        std::fs::write(&path, lazy_json::dumps(&doc, true)).unwrap();

        let rtns = read_flushed(&path, &[2, 1, 0], Some(EntryField::ReturnCode)).unwrap();
        assert_eq!(rtns, [JsonValue::from(2), JsonValue::Null, JsonValue::from(0)]);
        let rtns = read_flushed(&path, &[1, 2], Some(EntryField::ReturnCode)).unwrap();
        assert_eq!(rtns, [JsonValue::Null, JsonValue::from(2)]);
        let entries = read_flushed(&path, &[0, 0, 1], None).unwrap();
        assert_eq!(entries[2], doc["cmds"][1]);
        assert_matches!(
            read_flushed(&path, &[0, 1, 7], None),
            Err(HistoryError::IndexOutOfRange { index: 7, len: 3 })
        );
    }

    #[test]
    fn test_flushes_apply_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut hist = JsonHistory::new(&config(dir.path(), 1)).unwrap();
        let mut rng = rand::rng();
        for i in 0..40 {
            hist.append(entry(&format!("cmd {i}"), 0)).unwrap();
            if rng.random_bool(0.3) {
                std::thread::sleep(Duration::from_millis(rng.random_range(0..3)));
            }
        }
        hist.flush(true).unwrap();
        let doc = load(hist.file().unwrap());
        let inputs: Vec<&str> = doc["cmds"].members().map(|c| c["inp"].as_str().unwrap()).collect();
        let expected: Vec<String> = (0..40).map(|i| format!("cmd {i}")).collect();
        assert_eq!(inputs, expected);
    }

    #[test]
    fn test_outputs_and_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path(), 1);
        config.store_stdout = true;
        config.save_cwd = false;
        let mut hist = JsonHistory::new(&config).unwrap();
        let mut e = entry("echo hi", 0);
        e.output = Some("hi\n".into());
        e.cwd = Some("/tmp".into());
        hist.append(e).unwrap();
        hist.append(entry("true", 0)).unwrap();
        assert_eq!(hist.outputs().slice(HistorySlice::ALL).unwrap(), [
            JsonValue::from("hi\n"),
            JsonValue::Null
        ]);
        assert_eq!(hist.get(0).unwrap().cwd, None);

        let mut config = config.clone();
        config.store_stdout = false;
        let mut hist = JsonHistory::new(&config).unwrap();
        let mut e = entry("echo hi", 0);
        e.output = Some("hi\n".into());
        hist.append(e).unwrap();
        assert!(hist.outputs().get(0).unwrap().is_null());
    }

    #[test]
    fn test_at_exit_unlocks() {
        let dir = tempfile::tempdir().unwrap();
        let mut hist = JsonHistory::new(&config(dir.path(), 100)).unwrap();
        hist.append(entry("ls", 0)).unwrap();
        let handle = hist.flush(true).unwrap().unwrap();
        assert!(handle.is_done());
        let doc = load(hist.file().unwrap());
        assert_eq!(doc["locked"], false);
        assert!(doc["ts"][1].as_f64().unwrap() >= doc["ts"][0].as_f64().unwrap());
        assert_eq!(doc["cmds"][0]["inp"], "ls");

        // A plain flush with nothing buffered has nothing to do.
        assert!(hist.flush(false).unwrap().is_none());
    }

    #[test]
    fn test_clear() {
        let dir = tempfile::tempdir().unwrap();
        let mut hist = JsonHistory::new(&config(dir.path(), 2)).unwrap();
        for i in 0..5 {
            hist.append(entry(&format!("echo {i}"), 0)).unwrap();
        }
        hist.clear().unwrap();
        assert_eq!(hist.len(), 0);
        assert_eq!(load(hist.file().unwrap())["cmds"].len(), 0);
        hist.append(entry("echo 0", 0)).unwrap();
        hist.append(entry("after", 0)).unwrap();
        assert_eq!(hist.inputs().slice(HistorySlice::ALL).unwrap(), ["echo 0", "after"]);
    }

    #[test]
    fn test_off_and_on() {
        let dir = tempfile::tempdir().unwrap();
        let mut hist = JsonHistory::new(&config(dir.path(), 100)).unwrap();
        hist.append(entry("one", 0)).unwrap();
        hist.set_remember(false);
        assert!(!hist.remember());
        assert_eq!(hist.len(), 0);
        hist.append(entry("secret", 0)).unwrap();
        hist.set_remember(true);
        hist.append(entry("two", 0)).unwrap();
        assert_eq!(hist.inputs().slice(HistorySlice::ALL).unwrap(), ["one", "two"]);
    }

    #[test]
    fn test_items_and_all_items() {
        let dir = tempfile::tempdir().unwrap();
        let other = object! {
            "cmds": [{"inp": "old command\n", "rtn": 0, "ts": [10.0, 11.0]}],
            "locked": false,
            "sessionid": "other",
            "ts": [10.0, 12.0],
        };
        std::fs::write(dir.path().join("xonsh-other.json"), lazy_json::dumps(&other, true)).unwrap();
        std::fs::write(dir.path().join("xonsh-broken.json"), "garbage").unwrap();

        let mut hist = JsonHistory::new(&config(dir.path(), 1)).unwrap();
        hist.append(entry("first", 0)).unwrap();
        hist.append(entry("second", 2)).unwrap();

        let items = hist.items(true).unwrap();
        let inputs: Vec<&str> = items.iter().map(|i| i.input.as_str()).collect();
        assert_eq!(inputs, ["second", "first"]);
        assert_eq!(items[0].return_code, Some(2));
        assert_eq!(items[0].session_id.as_deref(), Some(hist.session_id()));

        let all = hist.all_items(false).unwrap();
        let inputs: Vec<&str> = all.iter().map(|i| i.input.as_str()).collect();
        assert_eq!(inputs, ["old command", "first", "second"]);
        assert_eq!(all[0].session_id.as_deref(), Some("other"));
        assert_eq!(all[0].timestamp, 10.0);
    }

    #[test]
    fn test_info() {
        let dir = tempfile::tempdir().unwrap();
        let mut hist = JsonHistory::new(&config(dir.path(), 5)).unwrap();
        hist.append(entry("ls", 0)).unwrap();
        let info = hist.info();
        let keys: Vec<&str> = info.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, [
            "backend",
            "sessionid",
            "filename",
            "length",
            "buffersize",
            "bufferlength",
            "gc options",
            "gc_last_size"
        ]);
        assert_eq!(info[0].1, "json");
        assert_eq!(info[3].1, "1");
        assert_eq!(info[4].1, "5");
        assert_eq!(info[5].1, "1");
        assert_eq!(info[6].1, "(8128, 'commands')");
        assert_eq!(info[7].1, "?");
    }

    #[test]
    fn test_gc_removes_closed_sessions_only() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), 100);
        let mut closed = vec![];
        for _ in 0..3 {
            let mut old = JsonHistory::new(&config).unwrap();
            old.append(entry("ls", 0)).unwrap();
            old.flush(true).unwrap();
            closed.push(old.file().unwrap().to_owned());
        }
        let hist = JsonHistory::new(&config).unwrap();

        let size = HistorySize::new(2.0, SizeUnits::Files);
        let outcome = hist.run_gc(Some(size), true, false).unwrap().wait().unwrap();
        assert_eq!(outcome.removed, [closed[0].clone()]);
        assert!(hist.file().unwrap().exists());
        assert_eq!(hist.info()[7].1, "(3, 'files')");
    }

    #[test]
    fn test_start_gc_waits_for_startup() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path(), 100);
        config.history_size = HistorySize::new(0.0, SizeUnits::Commands);
        let empty = dir.path().join("xonsh-crashed.json");
        std::fs::write(&empty, "").unwrap();
        let hist = JsonHistory::new(&config).unwrap();
        hist.start_gc().unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert!(empty.exists());
        hist.startup_finished();
        for _ in 0..200 {
            if !empty.exists() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(!empty.exists());
    }

    #[test]
    fn test_field_through_trait() {
        let dir = tempfile::tempdir().unwrap();
        let mut hist = JsonHistory::new(&config(dir.path(), 2)).unwrap();
        for i in 0..3 {
            hist.append(entry(&format!("echo {i}"), 0)).unwrap();
        }
        let backend: &dyn HistoryBackend = &hist;
        assert_eq!(
            backend.field(EntryField::Input, "1:".parse().unwrap()).unwrap(),
            ["echo 1", "echo 2"]
        );
    }
}
