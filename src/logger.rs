//! Session log for the `simucolors` binary.
//!
//! One file per session, truncated on start. Lives in the platform data
//! directory under `SimuColors/simucolors.log` unless `--log` names another
//! path. The `log_info!`/`log_warn!`/`log_err!` macros do nothing until the
//! log is opened, so library users never get a file they did not ask for.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

static LOG_FILE: OnceLock<Mutex<File>> = OnceLock::new();

/// Append `line` verbatim. Write errors are dropped.
pub fn write_line(line: &str) {
    if let Some(mutex) = LOG_FILE.get()
        && let Ok(mut file) = mutex.lock()
    {
        let _ = writeln!(file, "{}", line);
    }
}

/// Append `[HH:MM:SS] [LEVEL] msg`.
pub fn write(level: &str, msg: &str) {
    if LOG_FILE.get().is_some() {
        write_line(&format!("[{}] [{}] {}", clock(), level, msg));
    }
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::logger::write("INFO", &format!($($arg)*));
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::logger::write("WARN", &format!($($arg)*));
    };
}

#[macro_export]
macro_rules! log_err {
    ($($arg:tt)*) => {
        $crate::logger::write("ERROR", &format!($($arg)*));
    };
}

/// Open the log at its default location.
pub fn init() {
    init_at(&default_path());
}

/// Open (truncating) the log at `path` and mirror panics into it.
/// Later calls are ignored once a log is open.
pub fn init_at(path: &Path) {
    if LOG_FILE.get().is_some() {
        return;
    }

    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    let file = match OpenOptions::new().create(true).write(true).truncate(true).open(path) {
        Ok(file) => file,
        Err(e) => {
            eprintln!("warning: no session log at {}: {}", path.display(), e);
            return;
        }
    };
    let _ = LOG_FILE.set(Mutex::new(file));

    let started = SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs());
    write_line(&format!("=== simucolors {} session, unix {} ===", env!("CARGO_PKG_VERSION"), started));
    write_line(&format!("Log file: {}", path.display()));

    let prev = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        write_line(&format!("[{}] [PANIC] {}", clock(), info));
        prev(info);
    }));
}

fn default_path() -> PathBuf {
    data_dir().join("SimuColors").join("simucolors.log")
}

fn data_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata);
        }
    }
    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join("Library").join("Application Support");
        }
    }
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        return PathBuf::from(xdg);
    }
    match std::env::var("HOME") {
        Ok(home) => PathBuf::from(home).join(".local").join("share"),
        Err(_) => PathBuf::from("."),
    }
}

/// UTC wall clock, `HH:MM:SS`.
fn clock() -> String {
    let secs = SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs());
    format!("{:02}:{:02}:{:02}", (secs % 86_400) / 3_600, (secs % 3_600) / 60, secs % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_format() {
        let c = clock();
        assert_eq!(c.len(), 8);
        assert_eq!(c.as_bytes()[2], b':');
        assert_eq!(c.as_bytes()[5], b':');
    }

    #[test]
    fn test_default_path_is_app_scoped() {
        let path = default_path();
        assert!(path.ends_with(Path::new("SimuColors").join("simucolors.log")));
    }
}
