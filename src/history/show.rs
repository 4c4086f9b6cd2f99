//! The actions of the `history` command, on already-parsed options.

use std::io::Write;

use json::JsonValue;

use crate::config::HistorySize;
use crate::error::Result;
use crate::history::history::{History, HistoryItem, HistorySlice};

/// Which sessions `show` lists.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SessionScope {
    /// The current session.
    #[default]
    Session,
    /// Every stored session, then the current one.
    All,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ShowOptions {
    pub scope: SessionScope,
    /// Pick these entries, in order. Empty means all of them.
    pub slices: Vec<HistorySlice>,
    /// Newest first.
    pub reverse: bool,
    /// Prefix each command with its index.
    pub numerate: bool,
    /// Prefix each command with its start time.
    pub show_time: bool,
    /// Only commands started at or after this time.
    pub start_time: Option<f64>,
    /// Only commands started before this time.
    pub end_time: Option<f64>,
    /// Only commands containing this text.
    pub contains: Option<String>,
    /// Terminate each command with NUL instead of newline.
    pub null_terminate: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub enum HistoryAction {
    Show(ShowOptions),
    Info { json: bool },
    Gc {
        size: Option<HistorySize>,
        blocking: bool,
        force: bool,
    },
    Clear,
    Off,
    On,
    File,
    Id,
}

/// Run `action`. Listings go to `out`, status messages to `err`.
pub fn execute(
    history: &History,
    action: &HistoryAction,
    out: &mut impl Write,
    err: &mut impl Write,
) -> Result<()> {
    match action {
        HistoryAction::Show(opts) => show(history, opts, out)?,
        HistoryAction::Info { json } => info(history, *json, out)?,
        HistoryAction::Gc {
            size,
            blocking,
            force,
        } => {
            let handle = history.run_gc(*size, *blocking, *force)?;
            if *blocking {
                let outcome = handle.wait()?;
                if outcome.refused {
                    writeln!(
                        err,
                        "History not collected: it would discard {} while keeping less. Use force to override.",
                        outcome.amount
                    )?;
                }
            }
        }
        HistoryAction::Clear => {
            history.clear()?;
            writeln!(err, "History cleared")?;
        }
        HistoryAction::Off => {
            history.set_remember(false);
            writeln!(err, "History off")?;
        }
        HistoryAction::On => {
            history.set_remember(true);
            writeln!(err, "History on")?;
        }
        HistoryAction::File => {
            if let Some(path) = history.file() {
                writeln!(out, "{}", path.display())?;
            }
        }
        HistoryAction::Id => writeln!(out, "{}", history.session_id())?,
    }
    Ok(())
}

/// Select the commands `opts` asks for, with their indices, in output order.
pub fn select_items(history: &History, opts: &ShowOptions) -> Result<Vec<(usize, HistoryItem)>> {
    let items = match opts.scope {
        SessionScope::Session => history.items(false)?,
        SessionScope::All => history.all_items(false)?,
    };
    let indices: Vec<usize> = if opts.slices.is_empty() {
        (0..items.len()).collect()
    } else {
        let mut picked = vec![];
        for slice in &opts.slices {
            picked.extend(slice.indices(items.len())?);
        }
        picked
    };

    let mut selected: Vec<(usize, HistoryItem)> = indices
        .into_iter()
        .map(|i| (i, items[i].clone()))
        .filter(|(_, item)| opts.start_time.is_none_or(|start| item.timestamp >= start))
        .filter(|(_, item)| opts.end_time.is_none_or(|end| item.timestamp < end))
        .filter(|(_, item)| {
            opts.contains
                .as_deref()
                .is_none_or(|needle| item.input.contains(needle))
        })
        .collect();
    if opts.reverse {
        selected.reverse();
    }
    Ok(selected)
}

fn show(history: &History, opts: &ShowOptions, out: &mut impl Write) -> Result<()> {
    let terminator = if opts.null_terminate { '\0' } else { '\n' };
    for (index, item) in select_items(history, opts)? {
        if opts.numerate {
            write!(out, "{index}:")?;
        }
        if opts.show_time {
            write!(out, "({:.2}) ", item.timestamp)?;
        } else if opts.numerate {
            write!(out, " ")?;
        }
        write!(out, "{}{terminator}", item.input)?;
    }
    Ok(())
}

fn info(history: &History, as_json: bool, out: &mut impl Write) -> Result<()> {
    let data = history.info();
    if as_json {
        let mut obj = JsonValue::new_object();
        for (key, value) in data {
            obj[key] = value.into();
        }
        writeln!(out, "{}", obj.dump())?;
    } else {
        for (key, value) in data {
            writeln!(out, "{key}: {value}")?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{HistoryAction, SessionScope, ShowOptions, execute};
    use crate::config::{BackendKind, HistoryConfig, HistorySize, SizeUnits};
    use crate::history::history::{CommandEntry, History, TimestampSpan};
    use crate::history::lazy_json;
    use json::object;
    use std::sync::Arc;

    fn history_with(dir: &std::path::Path, inputs: &[&str]) -> Arc<History> {
        let history = History::from_config(&HistoryConfig::new(dir));
        for (i, input) in inputs.iter().enumerate() {
            let ts = 100.0 + i as f64;
            history
                .append(CommandEntry::new(*input, Some(0), TimestampSpan::new(ts, Some(ts))))
                .unwrap();
        }
        history
    }

    fn run(history: &History, action: HistoryAction) -> (String, String) {
        let mut out = vec![];
        let mut err = vec![];
        execute(history, &action, &mut out, &mut err).unwrap();
        (String::from_utf8(out).unwrap(), String::from_utf8(err).unwrap())
    }

    fn show(history: &History, opts: ShowOptions) -> String {
        run(history, HistoryAction::Show(opts)).0
    }

    #[test]
    fn test_show_slices_and_flags() {
        let dir = tempfile::tempdir().unwrap();
        let history = history_with(dir.path(), &["a", "b", "c", "d", "e"]);

        assert_eq!(show(&history, ShowOptions::default()), "a\nb\nc\nd\ne\n");
        let opts = |slices: &[&str]| ShowOptions {
            slices: slices.iter().map(|s| s.parse().unwrap()).collect(),
            ..Default::default()
        };
        assert_eq!(show(&history, opts(&["3"])), "d\n");
        assert_eq!(show(&history, opts(&["1:3"])), "b\nc\n");
        assert_eq!(show(&history, opts(&["1::2"])), "b\nd\n");
        assert_eq!(show(&history, opts(&["-4:-2"])), "b\nc\n");
        assert_eq!(show(&history, opts(&["0", "-1"])), "a\ne\n");

        let numbered = ShowOptions {
            numerate: true,
            reverse: true,
            slices: vec!["-2:".parse().unwrap()],
            ..Default::default()
        };
        assert_eq!(show(&history, numbered), "4: e\n3: d\n");

        let timed = ShowOptions {
            show_time: true,
            numerate: true,
            slices: vec!["0".parse().unwrap()],
            ..Default::default()
        };
        assert_eq!(show(&history, timed), "0:(100.00) a\n");
    }

    #[test]
    fn test_show_filters() {
        let dir = tempfile::tempdir().unwrap();
        let history = history_with(dir.path(), &["git status", "ls", "git log", "pwd"]);
        let opts = ShowOptions {
            start_time: Some(101.0),
            end_time: Some(103.0),
            ..Default::default()
        };
        assert_eq!(show(&history, opts), "ls\ngit log\n");

        let opts = ShowOptions {
            contains: Some("git".into()),
            null_terminate: true,
            ..Default::default()
        };
        assert_eq!(show(&history, opts), "git status\0git log\0");
    }

    #[test]
    fn test_show_all_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let old = object! {
            "cmds": [{"inp": "from before", "rtn": 0, "ts": [1.0, 2.0]}],
            "locked": false,
            "sessionid": "old",
            "ts": [1.0, 3.0],
        };
        std::fs::write(dir.path().join("xonsh-old.json"), lazy_json::dumps(&old, true)).unwrap();
        let history = history_with(dir.path(), &["now"]);
        let opts = ShowOptions {
            scope: SessionScope::All,
            ..Default::default()
        };
        assert_eq!(show(&history, opts), "from before\nnow\n");
        assert_eq!(show(&history, ShowOptions::default()), "now\n");
    }

    #[test]
    fn test_clear_off_on() {
        let dir = tempfile::tempdir().unwrap();
        let history = history_with(dir.path(), &["a", "b"]);

        assert_eq!(run(&history, HistoryAction::Off), (String::new(), "History off\n".into()));
        assert!(!history.remember());
        history
            .append(CommandEntry::new("hidden", Some(0), TimestampSpan::default()))
            .unwrap();
        let (_, err) = run(&history, HistoryAction::On);
        assert!(err.ends_with("History on\n"));
        assert_eq!(history.len(), 2);

        let (_, err) = run(&history, HistoryAction::Clear);
        assert_eq!(err, "History cleared\n");
        assert!(history.is_empty());
        assert_eq!(show(&history, ShowOptions::default()), "");
    }

    #[test]
    fn test_file_id_and_info() {
        let dir = tempfile::tempdir().unwrap();
        let history = history_with(dir.path(), &["a"]);
        let (out, _) = run(&history, HistoryAction::File);
        assert_eq!(out.trim_end(), history.file().unwrap().display().to_string());
        let (out, _) = run(&history, HistoryAction::Id);
        assert_eq!(out, format!("{}\n", history.session_id()));

        let (out, _) = run(&history, HistoryAction::Info { json: false });
        assert!(out.starts_with("backend: json\n"));
        assert!(out.contains("length: 1\n"));

        let (out, _) = run(&history, HistoryAction::Info { json: true });
        let parsed = json::parse(&out).unwrap();
        assert_eq!(parsed["backend"], "json");
        assert_eq!(parsed["sessionid"], history.session_id());
    }

    #[test]
    fn test_gc_action() {
        let dir = tempfile::tempdir().unwrap();
        let history = history_with(dir.path(), &["a"]);
        let crashed = dir.path().join("xonsh-crashed.json");
        std::fs::write(&crashed, "").unwrap();
        let action = HistoryAction::Gc {
            size: Some(HistorySize::new(100.0, SizeUnits::Commands)),
            blocking: true,
            force: false,
        };
        assert_eq!(run(&history, action), (String::new(), String::new()));
        assert!(!crashed.exists());
    }

    #[test]
    fn test_dummy_backend_actions() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = HistoryConfig::new(dir.path());
        config.backend = BackendKind::Dummy;
        let history = History::from_config(&config);
        assert_eq!(show(&history, ShowOptions::default()), "dummy in action\n");
        let (out, _) = run(&history, HistoryAction::File);
        assert!(out.is_empty());
    }
}
