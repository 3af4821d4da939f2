//! Pairing requests for unknown direct senders.
//!
//! A pairing request mints a short code the owner approves out-of-band.
//! Codes expire after an hour; each channel holds at most three pending
//! requests so an unknown-sender flood cannot grow the file unbounded.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clawdis_core::{generate_pairing_code, write_json_atomic};
use serde::{Deserialize, Serialize};

pub const PAIRING_SCHEMA_VERSION: u32 = 1;
pub const PAIRING_TTL_SECONDS: u64 = 3_600;
pub const MAX_PENDING_PAIRING_PER_CHANNEL: usize = 3;

fn pairing_schema_version() -> u32 {
    PAIRING_SCHEMA_VERSION
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// Public struct `PairingRequest` used across Clawdis components.
pub struct PairingRequest {
    pub code: String,
    pub channel: String,
    pub peer: String,
    pub created_at_unix: u64,
    pub expires_at_unix: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct PairingFile {
    #[serde(default = "pairing_schema_version")]
    schema_version: u32,
    #[serde(default)]
    requests: Vec<PairingRequest>,
}

impl Default for PairingFile {
    fn default() -> Self {
        Self {
            schema_version: PAIRING_SCHEMA_VERSION,
            requests: Vec::new(),
        }
    }
}

#[derive(Debug)]
/// File-backed pairing request store for one channel.
pub struct PairingStore {
    path: PathBuf,
    channel: String,
    file: PairingFile,
}

impl PairingStore {
    pub fn open(path: impl AsRef<Path>, channel: impl Into<String>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read pairing store {}", path.display()))?;
            let parsed = serde_json::from_str::<PairingFile>(&raw)
                .with_context(|| format!("failed to parse pairing store {}", path.display()))?;
            if parsed.schema_version != PAIRING_SCHEMA_VERSION {
                bail!(
                    "unsupported pairing store schema_version {} (expected {})",
                    parsed.schema_version,
                    PAIRING_SCHEMA_VERSION
                );
            }
            parsed
        } else {
            PairingFile::default()
        };
        Ok(Self {
            path,
            channel: channel.into(),
            file,
        })
    }

    /// Pending (non-expired) requests at `now`.
    pub fn list(&self, now_unix: u64) -> Vec<&PairingRequest> {
        self.file
            .requests
            .iter()
            .filter(|request| request.expires_at_unix > now_unix)
            .collect()
    }

    /// Creates (or re-issues) a pairing request for `peer`.
    ///
    /// An unexpired request for the same peer is returned as-is; an expired
    /// one is replaced with a fresh code.
    pub fn create_request(&mut self, peer: &str, now_unix: u64) -> Result<PairingRequest> {
        let peer = peer.trim();
        if peer.is_empty() {
            bail!("pairing peer cannot be empty");
        }
        self.purge_expired(now_unix);

        if let Some(existing) = self
            .file
            .requests
            .iter()
            .find(|request| request.peer == peer)
        {
            return Ok(existing.clone());
        }
        if self.file.requests.len() >= MAX_PENDING_PAIRING_PER_CHANNEL {
            bail!(
                "channel '{}' already has {} pending pairing requests",
                self.channel,
                MAX_PENDING_PAIRING_PER_CHANNEL
            );
        }

        let request = PairingRequest {
            code: generate_pairing_code(),
            channel: self.channel.clone(),
            peer: peer.to_string(),
            created_at_unix: now_unix,
            expires_at_unix: now_unix + PAIRING_TTL_SECONDS,
        };
        self.file.requests.push(request.clone());
        self.save()?;
        Ok(request)
    }

    /// Approves a pending code, removing it and returning the peer to admit.
    pub fn approve(&mut self, code: &str, now_unix: u64) -> Result<String> {
        self.purge_expired(now_unix);
        let normalized = code.trim().to_ascii_uppercase();
        let index = self
            .file
            .requests
            .iter()
            .position(|request| request.code == normalized)
            .with_context(|| format!("pairing code '{normalized}' not found or expired"))?;
        let request = self.file.requests.remove(index);
        self.save()?;
        Ok(request.peer)
    }

    /// Drops expired requests, persisting only when something changed.
    pub fn purge_expired(&mut self, now_unix: u64) {
        let before = self.file.requests.len();
        self.file
            .requests
            .retain(|request| request.expires_at_unix > now_unix);
        if self.file.requests.len() != before {
            let _ = self.save();
        }
    }

    fn save(&self) -> Result<()> {
        write_json_atomic(&self.path, &self.file).context("failed to save pairing store")
    }
}
