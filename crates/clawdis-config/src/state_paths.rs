//! On-disk state layout under the Clawdis state directory.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clawdis_core::log_files::daily_log_file_name;

const STATE_DIR_ENV: &str = "CLAWDIS_STATE_DIR";
const STATE_DIR_NAME: &str = ".clawdis";

#[derive(Debug, Clone, PartialEq, Eq)]
/// Resolved state directory with accessors for every well-known path.
pub struct StateDir {
    root: PathBuf,
}

impl StateDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolves `$CLAWDIS_STATE_DIR`, falling back to `~/.clawdis`.
    pub fn resolve() -> Result<Self> {
        if let Ok(explicit) = std::env::var(STATE_DIR_ENV) {
            let trimmed = explicit.trim();
            if !trimmed.is_empty() {
                return Ok(Self::new(trimmed));
            }
        }
        let home = std::env::var("HOME").context("HOME is not set; cannot locate state dir")?;
        Ok(Self::new(Path::new(&home).join(STATE_DIR_NAME)))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("clawdis.json")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.root.join("sessions")
    }

    pub fn session_store_path(&self) -> PathBuf {
        self.sessions_dir().join("sessions.json")
    }

    pub fn transcript_path(&self, session_id: &str) -> PathBuf {
        self.sessions_dir().join(format!("{session_id}.jsonl"))
    }

    pub fn credentials_dir(&self) -> PathBuf {
        self.root.join("credentials")
    }

    /// Per-channel credential file, e.g. `credentials/whatsapp-pairing.json`.
    pub fn channel_credentials_path(&self, channel_id: &str, kind: &str) -> PathBuf {
        self.credentials_dir()
            .join(format!("{channel_id}-{kind}.json"))
    }

    pub fn nodes_pending_path(&self) -> PathBuf {
        self.root.join("nodes").join("pending.json")
    }

    pub fn nodes_paired_path(&self) -> PathBuf {
        self.root.join("nodes").join("paired.json")
    }

    pub fn media_dir(&self) -> PathBuf {
        self.root.join("media")
    }

    pub fn cron_jobs_path(&self) -> PathBuf {
        self.root.join("cron").join("jobs.json")
    }

    pub fn cron_run_log_path(&self) -> PathBuf {
        self.root.join("cron").join("runs.jsonl")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn log_file_path(&self) -> PathBuf {
        self.log_dir().join(daily_log_file_name("clawdis", None))
    }
}
