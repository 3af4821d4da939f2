//! Atomic snapshot writes.
//!
//! Session, config, pairing, and cron state each live in one JSON file that
//! readers may open at any moment, so replacement has to be all-or-nothing:
//! the new content goes to a scratch file first, is flushed to disk, and
//! only then renamed over the destination. A crash mid-write leaves the old
//! snapshot untouched and at worst an orphaned scratch file.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Serialize;

use crate::identifiers::temp_file_token;

/// Replaces `path` with `content`, never exposing a partial file.
pub fn write_text_atomic(path: &Path, content: &str) -> Result<()> {
    let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
        bail!("snapshot destination '{}' has no file name", path.display());
    };
    if path.is_dir() {
        bail!("snapshot destination '{}' is a directory", path.display());
    }

    let parent_dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent_dir)
        .with_context(|| format!("failed to create {}", parent_dir.display()))?;

    let scratch_path = parent_dir.join(format!(".{file_name}.{}", temp_file_token()));
    let write_result = (|| -> Result<()> {
        let mut scratch = File::create(&scratch_path)
            .with_context(|| format!("failed to create scratch {}", scratch_path.display()))?;
        scratch
            .write_all(content.as_bytes())
            .with_context(|| format!("failed to write scratch {}", scratch_path.display()))?;
        // Flush to disk before the rename, otherwise a crash can promote an
        // empty file over a good snapshot.
        scratch
            .sync_all()
            .with_context(|| format!("failed to sync scratch {}", scratch_path.display()))?;
        fs::rename(&scratch_path, path).with_context(|| {
            format!(
                "failed to promote scratch into snapshot {}",
                path.display()
            )
        })
    })();

    if write_result.is_err() {
        let _ = fs::remove_file(&scratch_path);
    }
    write_result
}

/// Serializes `value` as pretty JSON and replaces `path` atomically.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value)
        .with_context(|| format!("failed to serialize snapshot {}", path.display()))?;
    write_text_atomic(path, &rendered)
}
