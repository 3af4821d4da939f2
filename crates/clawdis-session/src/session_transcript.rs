//! Append-only per-session transcripts (`sessions/<sessionId>.jsonl`).

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// One transcript line.
pub struct TranscriptRecord {
    pub timestamp_unix_ms: u64,
    pub role: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

pub fn append_transcript(path: &Path, record: &TranscriptRecord) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }
    let line = serde_json::to_string(record).context("failed to serialize transcript record")?;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open transcript {}", path.display()))?;
    writeln!(file, "{line}")
        .with_context(|| format!("failed to append transcript {}", path.display()))?;
    Ok(())
}

/// Reads the last `limit` transcript records; zero means everything.
/// Malformed lines are skipped rather than failing the whole read.
pub fn read_transcript(path: &Path, limit: usize) -> Result<Vec<TranscriptRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read transcript {}", path.display()))?;
    let mut records = raw
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str::<TranscriptRecord>(line).ok())
        .collect::<Vec<_>>();
    if limit > 0 && records.len() > limit {
        records = records.split_off(records.len() - limit);
    }
    Ok(records)
}
