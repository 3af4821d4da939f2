//! Log file layout.
//!
//! Clawdis keeps two kinds of logs. Operational logs are one file per day
//! (`clawdis-YYYY-MM-DD.log`) with retention measured in days: writing
//! today's line prunes files whose date stamp has aged out. Run logs (cron
//! executions) are a single JSONL file with a byte cap: when an append
//! would overflow, the oldest lines are shed and the newest kept, so the
//! recent history the status RPCs read survives.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};

use crate::atomic_io::write_text_atomic;

pub const DEFAULT_LOG_KEEP_DAYS: u32 = 14;

/// Daily log file name, e.g. `clawdis-2026-08-02.log`.
pub fn daily_log_file_name(prefix: &str, date: Option<NaiveDate>) -> String {
    let date = date.unwrap_or_else(|| Utc::now().date_naive());
    format!("{}-{}.log", prefix, date.format("%Y-%m-%d"))
}

/// Appends one line to today's log under `dir`, pruning sibling day files
/// older than `keep_days`. Returns the path written to.
pub fn append_daily_log_line(
    dir: &Path,
    prefix: &str,
    line: &str,
    keep_days: u32,
) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create log dir {}", dir.display()))?;

    let today = Utc::now().date_naive();
    let path = dir.join(daily_log_file_name(prefix, Some(today)));
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    writeln!(file, "{line}").with_context(|| format!("failed to append {}", path.display()))?;

    prune_dated_logs(dir, prefix, today, keep_days);
    Ok(path)
}

/// Removes `{prefix}-YYYY-MM-DD.log` siblings older than the retention
/// window. Files whose names do not parse as a date are left alone.
fn prune_dated_logs(dir: &Path, prefix: &str, today: NaiveDate, keep_days: u32) {
    if keep_days == 0 {
        return;
    }
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(date) = dated_log_name(&name, prefix) else {
            continue;
        };
        let age_days = today.signed_duration_since(date).num_days();
        if age_days >= i64::from(keep_days) {
            let _ = std::fs::remove_file(entry.path());
        }
    }
}

fn dated_log_name(name: &str, prefix: &str) -> Option<NaiveDate> {
    let stamped = name
        .strip_prefix(prefix)?
        .strip_prefix('-')?
        .strip_suffix(".log")?;
    NaiveDate::parse_from_str(stamped, "%Y-%m-%d").ok()
}

/// Appends one JSONL line, keeping the whole file under `max_bytes`.
///
/// On overflow the file is rewritten with only the newest lines that fit in
/// half the cap, then the new line is appended; readers always see the most
/// recent records.
pub fn append_jsonl_capped(path: &Path, line: &str, max_bytes: u64) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }

    let incoming = line.len() as u64 + 1;
    let current = std::fs::metadata(path).map(|meta| meta.len()).unwrap_or(0);
    if max_bytes > 0 && current + incoming > max_bytes {
        shed_oldest_lines(path, max_bytes / 2)
            .with_context(|| format!("failed to compact {}", path.display()))?;
    }

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    writeln!(file, "{line}").with_context(|| format!("failed to append {}", path.display()))?;
    Ok(())
}

fn shed_oldest_lines(path: &Path, retain_bytes: u64) -> Result<()> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(_) => return Ok(()),
    };
    let mut kept = Vec::new();
    let mut kept_bytes = 0u64;
    for line in raw.lines().rev() {
        let line_bytes = line.len() as u64 + 1;
        if kept_bytes + line_bytes > retain_bytes {
            break;
        }
        kept_bytes += line_bytes;
        kept.push(line);
    }
    kept.reverse();
    let mut compacted = kept.join("\n");
    if !compacted.is_empty() {
        compacted.push('\n');
    }
    write_text_atomic(path, &compacted)
}
