//! Engine transcript logging.
//!
//! When a `log_dir` is configured, every line exchanged with the engine is
//! appended to `{log_dir}/{engine_id}.log` with a UTC timestamp and a
//! direction tag (`SEND` for commands, `RECV` for engine output). Transcripts
//! are the main debugging tool for protocol issues: a hung health check or a
//! misparsed info line is obvious in the file even when the process is gone.

use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::Path,
    sync::{Arc, Mutex},
};

use chrono::Utc;

/// Thread-safe handle to an append-only transcript file.
///
/// Holds `None` when transcript logging is disabled; `log_line` is then a
/// no-op so call sites never need to branch.
pub type LogHandle = Arc<Mutex<Option<File>>>;

/// Open (or create) a transcript at `{log_dir}/{engine_id}.log`.
///
/// Returns a disabled handle when `log_dir` is `None` or the file cannot be
/// created; transcript failures must never take the engine down.
pub fn open_transcript(log_dir: Option<&str>, engine_id: &str) -> LogHandle {
    let file = log_dir.and_then(|dir| {
        std::fs::create_dir_all(dir).ok()?;
        let path = Path::new(dir).join(format!("{}.log", engine_id));
        OpenOptions::new().create(true).append(true).open(path).ok()
    });
    Arc::new(Mutex::new(file))
}

/// Append one timestamped line to the transcript (if enabled).
pub fn log_line(handle: &LogHandle, direction: &str, line: &str) {
    if let Ok(mut guard) = handle.lock() {
        if let Some(ref mut file) = *guard {
            let ts = Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ");
            let _ = writeln!(file, "[{}] {}: {}", ts, direction, line);
            let _ = file.flush();
        }
    }
}
