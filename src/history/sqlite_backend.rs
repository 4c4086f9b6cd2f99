//! A backend storing every session's commands in one SQLite table.
//!
//! Commands are written as they are appended; there is nothing to flush. A copy of this
//! session's recorded commands is kept in memory for indexing.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rusqlite::{Connection, params};

use crate::config::{BackendKind, HistControl, HistoryConfig, HistorySize, SizeUnits};
use crate::error::{HistoryError, Result};
use crate::flog::{flog, flogf};
use crate::history::file::new_session_id;
use crate::history::flusher::FlushHandle;
use crate::history::gc::{GcHandle, GcOutcome, StartupGate};
use crate::history::history::{
    CommandEntry, HistoryBackend, HistoryItem, IgnorePolicy, normalize_index,
};

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Open the database and make sure the history table exists.
fn open_db(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS xonsh_history (
            inp TEXT,
            rtn INTEGER,
            tsb REAL,
            tse REAL,
            sessionid TEXT,
            out TEXT,
            info TEXT,
            frequency INTEGER DEFAULT 1
        );",
    )?;
    // Tables from before frequency tracking lack the column.
    let has_frequency = conn
        .prepare("SELECT 1 FROM pragma_table_info('xonsh_history') WHERE name = 'frequency'")?
        .exists([])?;
    if !has_frequency {
        conn.execute_batch("ALTER TABLE xonsh_history ADD COLUMN frequency INTEGER DEFAULT 1;")?;
    }
    conn.execute_batch("CREATE INDEX IF NOT EXISTS idx_inp_history ON xonsh_history(inp);")?;
    Ok(conn)
}

/// Delete all but the `keep` most recent commands. Returns the number deleted.
fn delete_all_but_newest(conn: &Connection, keep: usize) -> rusqlite::Result<usize> {
    conn.execute(
        "DELETE FROM xonsh_history WHERE rowid NOT IN \
         (SELECT rowid FROM xonsh_history ORDER BY tsb DESC LIMIT ?)",
        params![keep as i64],
    )
}

/// The only policy this backend supports is a command count.
fn commands_to_keep(size: HistorySize) -> Result<usize> {
    match size.units {
        SizeUnits::Commands => Ok(size.limit.max(0.0) as usize),
        units => Err(HistoryError::InvalidRetentionUnits(format!(
            "{units} (the sqlite backend only supports commands)"
        ))),
    }
}

fn sweep(path: &Path, keep: usize) -> Result<GcOutcome> {
    let conn = open_db(path)?;
    let deleted = delete_all_but_newest(&conn, keep)?;
    flogf!(history_gc, "Deleted {} commands from {}", deleted, path.display());
    Ok(GcOutcome {
        amount: deleted as f64,
        ..Default::default()
    })
}

pub struct SqliteHistory {
    session_id: String,
    path: PathBuf,
    conn: Connection,
    policy: IgnorePolicy,
    store_stdout: bool,
    remember: bool,
    history_size: HistorySize,
    last_input: Option<String>,
    entries: Vec<CommandEntry>,
    startup: Arc<StartupGate>,
}

impl SqliteHistory {
    pub fn new(config: &HistoryConfig) -> Result<Self> {
        let path = config.sqlite_path();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| HistoryError::DataDirMissing {
                path: parent.to_owned(),
                source,
            })?;
        }
        let conn = open_db(&path)?;
        Ok(Self {
            session_id: new_session_id(),
            path,
            conn,
            policy: IgnorePolicy::from_config(config),
            store_stdout: config.store_stdout,
            remember: true,
            history_size: config.history_size,
            last_input: None,
            entries: vec![],
            startup: StartupGate::new(),
        })
    }

    fn insert(&self, entry: &CommandEntry) -> Result<()> {
        let input = entry.input.trim_end();
        let tx = self.conn.unchecked_transaction()?;
        let frequency: i64 = if self.policy.control.contains(HistControl::ERASE_DUPS) {
            let previous: i64 = tx.query_row(
                "SELECT coalesce(sum(frequency), 0) FROM xonsh_history WHERE inp = ?",
                params![input],
                |row| row.get(0),
            )?;
            tx.execute("DELETE FROM xonsh_history WHERE inp = ?", params![input])?;
            previous + 1
        } else {
            1
        };
        let output = if self.store_stdout {
            entry.output.as_deref()
        } else {
            None
        };
        tx.execute(
            "INSERT INTO xonsh_history (inp, rtn, tsb, tse, sessionid, out, frequency) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                input,
                entry.return_code,
                entry.timestamp.start,
                entry.timestamp.end,
                self.session_id,
                output,
                frequency
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn query_items(&self, session: Option<&str>, newest_first: bool) -> Result<Vec<HistoryItem>> {
        let order = if newest_first { "DESC" } else { "ASC" };
        let sql = format!(
            "SELECT inp, tsb, rtn, sessionid FROM xonsh_history \
             WHERE ?1 IS NULL OR sessionid = ?1 ORDER BY tsb {order}"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![session], |row| {
            Ok(HistoryItem {
                input: row.get(0)?,
                timestamp: row.get::<_, Option<f64>>(1)?.unwrap_or_default(),
                return_code: row.get(2)?,
                session_id: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    fn count(&self, session: Option<&str>) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT count(*) FROM xonsh_history WHERE ?1 IS NULL OR sessionid = ?1",
            params![session],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// How many times `input` has been run, as tracked when erasing duplicates.
    pub fn frequency(&self, input: &str) -> Result<u64> {
        let freq: i64 = self.conn.query_row(
            "SELECT coalesce(sum(frequency), 0) FROM xonsh_history WHERE inp = ?",
            params![input],
            |row| row.get(0),
        )?;
        Ok(freq as u64)
    }
}

impl HistoryBackend for SqliteHistory {
    fn kind(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn file(&self) -> Option<&Path> {
        Some(&self.path)
    }

    fn append(&mut self, entry: CommandEntry) -> Result<Option<FlushHandle>> {
        if !self.remember {
            return Ok(None);
        }
        if self.policy.should_ignore(&entry, self.last_input.as_deref()) {
            flog!(history, "Not recording", entry.input.trim_end());
            return Ok(None);
        }
        self.insert(&entry)?;
        self.last_input = Some(entry.input.clone());
        self.entries.push(entry);
        Ok(None)
    }

    fn flush(&mut self, _at_exit: bool) -> Result<Option<FlushHandle>> {
        Ok(None)
    }

    fn items(&self, newest_first: bool) -> Result<Vec<HistoryItem>> {
        self.query_items(Some(&self.session_id), newest_first)
    }

    fn all_items(&self, newest_first: bool) -> Result<Vec<HistoryItem>> {
        self.query_items(None, newest_first)
    }

    /// Only command counts are supported, and there is no over-deletion guard.
    fn run_gc(&self, size: Option<HistorySize>, blocking: bool, _force: bool) -> Result<GcHandle> {
        let keep = commands_to_keep(size.unwrap_or(self.history_size))?;
        if blocking {
            let deleted = delete_all_but_newest(&self.conn, keep)?;
            return Ok(GcHandle::finished(Ok(GcOutcome {
                amount: deleted as f64,
                ..Default::default()
            })));
        }
        let path = self.path.clone();
        GcHandle::spawn(move || sweep(&path, keep))
    }

    fn start_gc(&self) -> Result<()> {
        let keep = commands_to_keep(self.history_size)?;
        let path = self.path.clone();
        let startup = Arc::clone(&self.startup);
        GcHandle::spawn(move || {
            startup.wait();
            sweep(&path, keep)
        })
        .map(drop)
    }

    fn startup_finished(&self) {
        self.startup.open();
    }

    fn info(&self) -> Vec<(&'static str, String)> {
        let count = |session| {
            self.count(session)
                .map_or_else(|err| format!("error: {err}"), |n| n.to_string())
        };
        vec![
            ("backend", self.kind().name().to_owned()),
            ("sessionid", self.session_id.clone()),
            ("filename", self.path.display().to_string()),
            ("session items", count(Some(self.session_id.as_str()))),
            ("all items", count(None)),
            ("gc options", self.history_size.to_string()),
        ]
    }

    fn len(&self) -> usize {
        if self.remember { self.entries.len() } else { 0 }
    }

    fn get(&self, index: isize) -> Result<CommandEntry> {
        let k = normalize_index(index, self.len())?;
        Ok(self.entries[k].clone())
    }

    fn clear(&mut self) -> Result<()> {
        self.entries.clear();
        self.last_input = None;
        self.conn.execute(
            "DELETE FROM xonsh_history WHERE sessionid = ?",
            params![self.session_id],
        )?;
        Ok(())
    }

    fn set_remember(&mut self, remember: bool) {
        self.remember = remember;
    }

    fn remember(&self) -> bool {
        self.remember
    }
}
