//! Durable per-session metadata.
//!
//! One snapshot file maps session keys to entries. Mutations re-read the
//! file under the store lock, apply, and atomically replace it, so
//! concurrent writers serialize while readers tolerate stale snapshots.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clawdis_core::{unix_time_ms, write_json_atomic, LockPolicy, StoreLock};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const SESSION_STORE_SCHEMA_VERSION: u32 = 1;

const WEBCHAT_CHANNEL: &str = "webchat";

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

fn session_store_schema_version() -> u32 {
    SESSION_STORE_SCHEMA_VERSION
}

fn generate_session_id() -> String {
    let sequence = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{:x}-{:x}", unix_time_ms(), sequence)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
/// Public struct `SessionEntry` used across Clawdis components.
pub struct SessionEntry {
    pub session_id: String,
    #[serde(default)]
    pub updated_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_sent: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aborted_last_run: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verbose_level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_activation: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct SessionStoreFile {
    #[serde(default = "session_store_schema_version", rename = "schemaVersion")]
    schema_version: u32,
    #[serde(default)]
    sessions: BTreeMap<String, SessionEntry>,
}

impl Default for SessionStoreFile {
    fn default() -> Self {
        Self {
            schema_version: SESSION_STORE_SCHEMA_VERSION,
            sessions: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
/// Partial update applied by directives and gateway `sessions.patch`.
pub struct SessionPatch {
    pub thinking_level: Option<String>,
    pub verbose_level: Option<String>,
    pub group_activation: Option<String>,
    pub system_sent: Option<bool>,
}

#[derive(Debug, Clone, Default)]
/// Run-terminal bookkeeping folded into the entry before fan-out.
pub struct SessionUsageDelta {
    pub channel: Option<String>,
    pub to: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub model: Option<String>,
    pub context_tokens: Option<u64>,
    pub aborted: bool,
}

#[derive(Debug)]
/// Public struct `SessionStore` used across Clawdis components.
pub struct SessionStore {
    path: PathBuf,
    sessions: BTreeMap<String, SessionEntry>,
    lock_policy: LockPolicy,
}

impl SessionStore {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = read_store_file(&path)?;
        debug!(
            target: "clawdis.session",
            path = %path.display(),
            sessions = file.sessions.len(),
            "loaded session store"
        );
        Ok(Self {
            path,
            sessions: file.sessions,
            lock_policy: LockPolicy::default(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn set_lock_policy(&mut self, lock_wait_ms: u64, lock_stale_ms: u64) {
        self.lock_policy = LockPolicy {
            wait: Duration::from_millis(lock_wait_ms.max(1)),
            stale_after: Duration::from_millis(lock_stale_ms),
        };
    }

    pub fn entry(&self, session_key: &str) -> Option<&SessionEntry> {
        self.sessions.get(session_key)
    }

    /// All entries, most recently touched first.
    pub fn list(&self) -> Vec<(String, SessionEntry)> {
        let mut rows = self
            .sessions
            .iter()
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| b.1.updated_at.cmp(&a.1.updated_at));
        rows
    }

    /// Returns the entry for `session_key`, creating it on first sight.
    pub fn ensure_entry(&mut self, session_key: &str) -> Result<SessionEntry> {
        if let Some(existing) = self.sessions.get(session_key) {
            return Ok(existing.clone());
        }
        let entry = SessionEntry {
            session_id: generate_session_id(),
            updated_at: unix_time_ms(),
            ..SessionEntry::default()
        };
        let created = entry.clone();
        self.mutate(session_key, move |slot| {
            *slot = Some(entry);
        })?;
        Ok(created)
    }

    /// Applies a partial update, bumping `updated_at` monotonically.
    pub fn patch(&mut self, session_key: &str, patch: SessionPatch) -> Result<SessionEntry> {
        self.ensure_entry(session_key)?;
        let now = unix_time_ms();
        self.mutate(session_key, move |slot| {
            if let Some(entry) = slot.as_mut() {
                if let Some(level) = patch.thinking_level {
                    entry.thinking_level = Some(level);
                }
                if let Some(level) = patch.verbose_level {
                    entry.verbose_level = Some(level);
                }
                if let Some(activation) = patch.group_activation {
                    entry.group_activation = Some(activation);
                }
                if let Some(system_sent) = patch.system_sent {
                    entry.system_sent = Some(system_sent);
                }
                entry.updated_at = next_updated_at(entry.updated_at, now);
            }
        })?;
        self.sessions
            .get(session_key)
            .cloned()
            .context("patched session entry vanished")
    }

    /// Folds a run's terminal usage into the entry. `webchat` never lands in
    /// `last_channel` so heartbeat targeting cannot pick it up.
    pub fn record_run_result(
        &mut self,
        session_key: &str,
        delta: SessionUsageDelta,
    ) -> Result<SessionEntry> {
        self.ensure_entry(session_key)?;
        let now = unix_time_ms();
        self.mutate(session_key, move |slot| {
            if let Some(entry) = slot.as_mut() {
                if let Some(channel) = delta
                    .channel
                    .as_deref()
                    .filter(|channel| *channel != WEBCHAT_CHANNEL)
                {
                    entry.last_channel = Some(channel.to_string());
                }
                if let Some(to) = delta.to.as_deref().filter(|to| !to.is_empty()) {
                    entry.last_to = Some(to.to_string());
                }
                let input = entry.input_tokens.unwrap_or(0) + delta.input_tokens;
                let output = entry.output_tokens.unwrap_or(0) + delta.output_tokens;
                entry.input_tokens = Some(input);
                entry.output_tokens = Some(output);
                entry.total_tokens = Some(input + output);
                if delta.model.is_some() {
                    entry.model = delta.model.clone();
                }
                if delta.context_tokens.is_some() {
                    entry.context_tokens = delta.context_tokens;
                }
                entry.aborted_last_run = Some(delta.aborted);
                entry.updated_at = next_updated_at(entry.updated_at, now);
            }
        })?;
        self.sessions
            .get(session_key)
            .cloned()
            .context("recorded session entry vanished")
    }

    /// Restores `updated_at` to a pre-run value. Heartbeats use this so a
    /// proactive run does not artificially rank the session recent.
    pub fn restore_updated_at(&mut self, session_key: &str, updated_at: u64) -> Result<()> {
        self.mutate(session_key, move |slot| {
            if let Some(entry) = slot.as_mut() {
                entry.updated_at = updated_at;
            }
        })
    }

    /// `/new` and `/reset`: the entry is removed outright.
    pub fn reset(&mut self, session_key: &str) -> Result<Option<SessionEntry>> {
        let previous = self.sessions.get(session_key).cloned();
        self.mutate(session_key, |slot| {
            *slot = None;
        })?;
        Ok(previous)
    }

    /// Nuclear clear: every session entry is dropped.
    pub fn clear_all(&mut self) -> Result<usize> {
        let _lock = StoreLock::acquire(&self.lock_path(), self.lock_policy)?;
        let file = read_store_file(&self.path)?;
        let removed = file.sessions.len();
        let empty = SessionStoreFile::default();
        write_store_file(&self.path, &empty)?;
        self.sessions = empty.sessions;
        Ok(removed)
    }

    fn mutate(
        &mut self,
        session_key: &str,
        apply: impl FnOnce(&mut Option<SessionEntry>),
    ) -> Result<()> {
        if session_key.trim().is_empty() {
            bail!("session key cannot be empty");
        }
        let _lock = StoreLock::acquire(&self.lock_path(), self.lock_policy)?;

        let mut file = read_store_file(&self.path)?;
        let mut slot = file.sessions.remove(session_key);
        apply(&mut slot);
        if let Some(entry) = slot {
            file.sessions.insert(session_key.to_string(), entry);
        }
        write_store_file(&self.path, &file)?;
        self.sessions = file.sessions;
        Ok(())
    }

    fn lock_path(&self) -> PathBuf {
        self.path.with_extension("lock")
    }
}

fn next_updated_at(previous: u64, now: u64) -> u64 {
    now.max(previous.saturating_add(1))
}

fn read_store_file(path: &Path) -> Result<SessionStoreFile> {
    if !path.exists() {
        return Ok(SessionStoreFile::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read session store {}", path.display()))?;
    let parsed = serde_json::from_str::<SessionStoreFile>(&raw)
        .with_context(|| format!("failed to parse session store {}", path.display()))?;
    if parsed.schema_version != SESSION_STORE_SCHEMA_VERSION {
        bail!(
            "unsupported session store schemaVersion {} (expected {})",
            parsed.schema_version,
            SESSION_STORE_SCHEMA_VERSION
        );
    }
    Ok(parsed)
}

fn write_store_file(path: &Path, file: &SessionStoreFile) -> Result<()> {
    write_json_atomic(path, file).context("failed to save session store")
}
