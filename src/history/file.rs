//! Helpers for session files: naming, timestamps, and atomic rewrites.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use tempfile::NamedTempFile;

use crate::flog::flog;

/// Session files are named `xonsh-<session id>.json`.
pub const SESSION_FILE_PREFIX: &str = "xonsh-";
pub const SESSION_FILE_SUFFIX: &str = ".json";

/// Default buffer size for writing session files.
const OUTPUT_BUFFER_SIZE: usize = 64 * 1024;

pub fn session_file_name(session_id: &str) -> String {
    format!("{SESSION_FILE_PREFIX}{session_id}{SESSION_FILE_SUFFIX}")
}

/// The default path of a session's file within `data_dir`.
pub fn session_file_path(data_dir: &Path, session_id: &str) -> PathBuf {
    data_dir.join(session_file_name(session_id))
}

/// Whether a directory entry looks like a session file.
pub fn is_session_file_name(name: &str) -> bool {
    name.len() > SESSION_FILE_PREFIX.len() + SESSION_FILE_SUFFIX.len()
        && name.starts_with(SESSION_FILE_PREFIX)
        && name.ends_with(SESSION_FILE_SUFFIX)
}

/// A fresh random session id, formatted like a version 4 UUID.
pub fn new_session_id() -> String {
    let mut bits: u128 = rand::rng().random();
    // Set the version and variant fields.
    bits = (bits & !(0xf_u128 << 76)) | (0x4_u128 << 76);
    bits = (bits & !(0x3_u128 << 62)) | (0x2_u128 << 62);
    let hex = format!("{bits:032x}");
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

/// Seconds since the epoch, negative before it.
pub fn time_to_seconds(ts: SystemTime) -> f64 {
    match ts.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs_f64(),
        Err(e) => -e.duration().as_secs_f64(),
    }
}

pub fn now_secs() -> f64 {
    time_to_seconds(SystemTime::now())
}

/// When the machine booted, in seconds since the epoch. Sessions started before this cannot
/// still be running.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn boot_time() -> Option<f64> {
    match nix::sys::sysinfo::sysinfo() {
        Ok(info) => Some(now_secs() - info.uptime().as_secs_f64()),
        Err(err) => {
            flog!(history_file, "Unable to determine boot time:", err);
            None
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn boot_time() -> Option<f64> {
    None
}

/// Replace `path` with the output of `write_fn`. The new contents are written to a temporary
/// file in the same directory, synced, and renamed into place, so readers never observe a
/// partially written file.
pub fn rewrite_via_temporary_file<F>(path: &Path, write_fn: F) -> std::io::Result<()>
where
    F: FnOnce(&mut BufWriter<&mut File>) -> std::io::Result<()>,
{
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)?;
    {
        let mut buffer = BufWriter::with_capacity(OUTPUT_BUFFER_SIZE, tmp.as_file_mut());
        write_fn(&mut buffer)?;
        buffer.flush()?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|err| {
        flog!(history_file, "Error renaming temporary history file:", err.error);
        err.error
    })?;
    Ok(())
}
