//! Session history configuration.
//!
//! Configuration is an explicit value handed to the backend constructors. It can be assembled
//! by hand (tests do this) or read from shell variables with [`HistoryConfig::from_vars`].

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use bitflags::bitflags;
use regex::Regex;

use crate::error::{HistoryError, Result};
use crate::flog::flog;

/// Number of entries buffered in memory before a flush is started.
pub const DEFAULT_BUFFER_SIZE: usize = 100;

/// Default retention when `XONSH_HISTORY_SIZE` is unset.
pub const DEFAULT_HISTORY_SIZE: HistorySize = HistorySize {
    limit: 8128.0,
    units: SizeUnits::Commands,
};

/// Which storage engine records the session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BackendKind {
    /// One indexed JSON file per session.
    #[default]
    Json,
    /// A single SQL database shared by all sessions.
    Sqlite,
    /// Records nothing.
    Dummy,
}

impl BackendKind {
    pub fn name(self) -> &'static str {
        match self {
            BackendKind::Json => "json",
            BackendKind::Sqlite => "sqlite",
            BackendKind::Dummy => "dummy",
        }
    }

    /// Resolve a backend name. Unknown names fall back to the JSON backend with a warning.
    pub fn from_name_or_default(name: &str) -> Self {
        match name.parse() {
            Ok(kind) => kind,
            Err(err) => {
                flog!(warning, err, "- using the json backend.");
                BackendKind::Json
            }
        }
    }
}

impl FromStr for BackendKind {
    type Err = HistoryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(BackendKind::Json),
            "sqlite" => Ok(BackendKind::Sqlite),
            "dummy" => Ok(BackendKind::Dummy),
            _ => Err(HistoryError::UnknownBackend(s.to_owned())),
        }
    }
}

bitflags! {
    /// The `HISTCONTROL` ignore policy.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct HistControl: u32 {
        /// Skip an entry whose input equals the previous recorded input.
        const IGNORE_DUPS = 1 << 0;
        /// Skip entries with a non-zero return code.
        const IGNORE_ERR = 1 << 1;
        /// Skip entries the caller marked as space-prefixed.
        const IGNORE_SPACE = 1 << 2;
        /// Drop older copies of an input (SQL backend only).
        const ERASE_DUPS = 1 << 3;
    }
}

impl HistControl {
    /// Parse a comma (or whitespace) separated option list. Unknown words are ignored.
    pub fn parse(s: &str) -> Self {
        let mut result = HistControl::empty();
        for word in s.split(|c: char| c == ',' || c.is_whitespace()) {
            match word.trim() {
                "ignoredups" => result |= HistControl::IGNORE_DUPS,
                "ignoreerr" => result |= HistControl::IGNORE_ERR,
                "ignorespace" => result |= HistControl::IGNORE_SPACE,
                "erasedups" => result |= HistControl::ERASE_DUPS,
                "" => {}
                other => flog!(history, "Ignoring unknown HISTCONTROL option", other),
            }
        }
        result
    }
}

/// The canonical retention units; each selects one garbage collection policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SizeUnits {
    Commands,
    Files,
    Seconds,
    Bytes,
}

impl SizeUnits {
    pub fn as_str(self) -> &'static str {
        match self {
            SizeUnits::Commands => "commands",
            SizeUnits::Files => "files",
            SizeUnits::Seconds => "s",
            SizeUnits::Bytes => "b",
        }
    }

    /// Resolve a unit alias to its canonical unit and the factor converting into it.
    fn lookup(unit: &str) -> Option<(SizeUnits, f64)> {
        const MINUTE: f64 = 60.0;
        const HOUR: f64 = 60.0 * MINUTE;
        const DAY: f64 = 24.0 * HOUR;
        const KIB: f64 = 1024.0;
        let found = match unit {
            "commands" | "command" | "cmds" | "cmd" => (SizeUnits::Commands, 1.0),
            "files" | "file" => (SizeUnits::Files, 1.0),
            "s" | "sec" | "secs" | "second" | "seconds" => (SizeUnits::Seconds, 1.0),
            "m" | "min" | "mins" | "minute" | "minutes" => (SizeUnits::Seconds, MINUTE),
            "h" | "hr" | "hour" | "hours" => (SizeUnits::Seconds, HOUR),
            "d" | "day" | "days" => (SizeUnits::Seconds, DAY),
            "w" | "week" | "weeks" => (SizeUnits::Seconds, 7.0 * DAY),
            "y" | "yr" | "year" | "years" => (SizeUnits::Seconds, 365.0 * DAY),
            "b" | "byte" | "bytes" => (SizeUnits::Bytes, 1.0),
            "kb" | "kib" => (SizeUnits::Bytes, KIB),
            "mb" | "mib" => (SizeUnits::Bytes, KIB * KIB),
            "gb" | "gib" => (SizeUnits::Bytes, KIB * KIB * KIB),
            "tb" | "tib" => (SizeUnits::Bytes, KIB * KIB * KIB * KIB),
            _ => return None,
        };
        Some(found)
    }
}

impl fmt::Display for SizeUnits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SizeUnits {
    type Err = HistoryError;

    fn from_str(s: &str) -> Result<Self> {
        let lowered = s.trim().to_ascii_lowercase();
        match SizeUnits::lookup(&lowered) {
            Some((units, factor)) if factor == 1.0 => Ok(units),
            _ => Err(HistoryError::InvalidRetentionUnits(s.to_owned())),
        }
    }
}

/// A retention budget: how much history the garbage collector keeps.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HistorySize {
    pub limit: f64,
    pub units: SizeUnits,
}

impl HistorySize {
    pub fn new(limit: f64, units: SizeUnits) -> Self {
        Self { limit, units }
    }

    /// Build a size from a number and a unit alias, converting to canonical units.
    pub fn from_parts(limit: f64, unit: &str) -> Result<Self> {
        let lowered = unit.trim().to_ascii_lowercase();
        let Some((units, factor)) = SizeUnits::lookup(&lowered) else {
            return Err(HistoryError::InvalidRetentionUnits(unit.to_owned()));
        };
        Ok(Self {
            limit: limit * factor,
            units,
        })
    }
}

impl fmt::Display for HistorySize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, '{}')", self.limit, self.units)
    }
}

impl FromStr for HistorySize {
    type Err = HistoryError;

    /// Parses `"8128 commands"`, `"2 days"`, `"10 mb"`. A bare number counts commands.
    fn from_str(s: &str) -> Result<Self> {
        let mut words = s.split_whitespace();
        let invalid = || HistoryError::InvalidRetentionUnits(s.to_owned());
        let number = words.next().ok_or_else(invalid)?;
        let limit: f64 = number.parse().map_err(|_| invalid())?;
        let unit = words.next().unwrap_or("commands");
        if words.next().is_some() {
            return Err(invalid());
        }
        HistorySize::from_parts(limit, unit)
    }
}

/// Options for one shell session's history.
#[derive(Clone, Debug)]
pub struct HistoryConfig {
    pub backend: BackendKind,
    /// Directory holding the per-session files.
    pub data_dir: PathBuf,
    /// Explicit session file, overriding `<data_dir>/xonsh-<id>.json`.
    pub history_file: Option<PathBuf>,
    /// Database path for the SQL backend.
    pub sqlite_file: Option<PathBuf>,
    pub history_size: HistorySize,
    pub hist_control: HistControl,
    pub store_stdout: bool,
    pub save_cwd: bool,
    pub ignore_regex: Option<Regex>,
    pub buffer_size: usize,
    /// Environment copied into the session header.
    pub environment: Option<BTreeMap<String, String>>,
}

impl HistoryConfig {
    /// A configuration storing session files in `data_dir`, with every other option at its
    /// default.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            backend: BackendKind::Json,
            data_dir: data_dir.into(),
            history_file: None,
            sqlite_file: None,
            history_size: DEFAULT_HISTORY_SIZE,
            hist_control: HistControl::empty(),
            store_stdout: false,
            save_cwd: true,
            ignore_regex: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            environment: None,
        }
    }

    /// Read the configuration from shell variables, as given by `lookup`.
    /// Only an unparseable `XONSH_HISTORY_SIZE` is an error.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let data_dir = lookup("XONSH_DATA_DIR")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| default_data_dir(&lookup));
        let mut config = HistoryConfig::new(data_dir);

        if let Some(name) = lookup("XONSH_HISTORY_BACKEND") {
            config.backend = BackendKind::from_name_or_default(&name);
        }
        config.history_file = lookup("XONSH_HISTORY_FILE")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);
        config.sqlite_file = lookup("XONSH_HISTORY_SQLITE_FILE")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);
        if let Some(size) = lookup("XONSH_HISTORY_SIZE").filter(|s| !s.trim().is_empty()) {
            config.history_size = size.parse()?;
        }
        if let Some(control) = lookup("HISTCONTROL") {
            config.hist_control = HistControl::parse(&control);
        }
        if let Some(store) = lookup("XONSH_STORE_STDOUT") {
            config.store_stdout = parse_bool(&store);
        }
        if let Some(save_cwd) = lookup("XONSH_HISTORY_SAVE_CWD") {
            config.save_cwd = parse_bool(&save_cwd);
        }
        if let Some(pattern) = lookup("XONSH_HISTORY_IGNORE_REGEX") {
            config.ignore_regex = compile_ignore_regex(&pattern);
        }
        if let Some(size) = lookup("XONSH_HISTORY_BUFFER_SIZE") {
            match size.trim().parse::<usize>() {
                Ok(n) if n > 0 => config.buffer_size = n,
                _ => flog!(warning, "Ignoring invalid XONSH_HISTORY_BUFFER_SIZE", size),
            }
        }
        Ok(config)
    }

    /// Read the configuration from the process environment, snapshotting it for the
    /// session header.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::from_vars(|name| std::env::var(name).ok())?;
        config.environment = Some(std::env::vars().collect());
        Ok(config)
    }

    /// The SQL database path, defaulting into the data directory.
    pub fn sqlite_path(&self) -> PathBuf {
        self.sqlite_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join("xonsh-history.sqlite"))
    }
}

fn default_data_dir(lookup: &impl Fn(&str) -> Option<String>) -> PathBuf {
    let base = lookup("XDG_DATA_HOME")
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .or_else(|| {
            lookup("HOME")
                .filter(|s| !s.is_empty())
                .map(|home| PathBuf::from(home).join(".local").join("share"))
        })
        .unwrap_or_else(std::env::temp_dir);
    base.join("xonsh")
}

/// Compile the ignore pattern. An invalid pattern disables regex ignoring.
pub fn compile_ignore_regex(pattern: &str) -> Option<Regex> {
    if pattern.is_empty() {
        return None;
    }
    match Regex::new(pattern) {
        Ok(re) => Some(re),
        Err(err) => {
            flog!(
                warning,
                "XONSH_HISTORY_IGNORE_REGEX is not a valid regular expression and will be ignored:",
                err
            );
            None
        }
    }
}

fn parse_bool(s: &str) -> bool {
    matches!(
        s.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on" | "y"
    )
}
