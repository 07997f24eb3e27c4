//! JSON line-delimited operation log.
//!
//! Each stack operation appends one line `{"operation", "timestamp_ms", "stats"}`
//! to the configured file. Logging is disabled until a path is set.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::config::StackConfig;
use crate::stack::StackStatistics;

static LOG_PATH: OnceLock<Mutex<Option<PathBuf>>> = OnceLock::new();

fn slot() -> &'static Mutex<Option<PathBuf>> {
    LOG_PATH.get_or_init(|| Mutex::new(None))
}

/// Sets (or clears) the file operation records are appended to.
pub fn set_log_path(path: Option<PathBuf>) {
    let mut guard = slot().lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    *guard = path;
}

/// Points the operation log at `config.log_path`.
pub fn init(config: &StackConfig) {
    set_log_path(config.log_path.clone());
}

pub fn enabled() -> bool {
    slot()
        .lock()
        .map(|guard| guard.is_some())
        .unwrap_or(false)
}

#[derive(Serialize)]
struct LogLine<'a> {
    operation: &'a str,
    timestamp_ms: u128,
    stats: &'a StackStatistics,
}

pub fn log_operation(name: &str, stats: &StackStatistics) -> io::Result<()> {
    let guard = slot().lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let Some(path) = guard.as_ref() else {
        return Ok(());
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let timestamp_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let line = serde_json::to_string(&LogLine {
        operation: name,
        timestamp_ms,
        stats,
    })?;

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_json_lines_when_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("ops.jsonl");
        set_log_path(Some(path.clone()));

        let stats = StackStatistics {
            min: 0.0,
            max: 1.0,
            mean: 0.5,
            element_count: 4,
        };
        log_operation("unit_test_op", &stats).unwrap();
        set_log_path(None);

        let contents = fs::read_to_string(&path).unwrap();
        let line = contents
            .lines()
            .find(|line| line.contains("unit_test_op"))
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(line).unwrap();
        assert_eq!(value["stats"]["element_count"], 4);
    }
}
