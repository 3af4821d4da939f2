//! Inbound pipeline: normalize → gate → schedule.
//!
//! Every surface event passes through here before the scheduler sees it.
//! Denials are terminal; mention-gated group chatter is kept as transcript
//! context; unknown senders on pairing channels get a pairing code instead
//! of an agent run.

use std::path::PathBuf;

use anyhow::Result;
use clawdis_channel::{
    evaluate_inbound_policy, ChannelEnvelope, PairingStore, PolicyDecision,
};
use clawdis_config::ClawdisConfig;
use clawdis_core::{unix_time_ms, unix_time_secs};
use clawdis_session::{append_transcript, resolve_session_key, TranscriptRecord};
use serde::Serialize;
use tracing::{debug, info};

use crate::run_scheduler::SessionScheduler;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "outcome")]
/// Enumerates supported `IngressOutcome` values.
pub enum IngressOutcome {
    /// The envelope reached the scheduler.
    Dispatched { session_key: String },
    /// Policy rejected the envelope outright.
    Denied { reason_code: String },
    /// Rejected for dispatch but recorded as conversation context.
    StoredContext { reason_code: String },
    /// Unknown sender on a pairing channel; a code was minted (or re-used).
    PairingStarted { code: String },
}

/// Public struct `IngressPipeline` used across Clawdis components.
pub struct IngressPipeline {
    scheduler: SessionScheduler,
    config: std::sync::Mutex<ClawdisConfig>,
    credentials_dir: PathBuf,
    transcript_dir: Option<PathBuf>,
}

impl IngressPipeline {
    pub fn new(
        scheduler: SessionScheduler,
        config: ClawdisConfig,
        credentials_dir: PathBuf,
        transcript_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            scheduler,
            config: std::sync::Mutex::new(config),
            credentials_dir,
            transcript_dir,
        }
    }

    pub fn update_config(&self, config: ClawdisConfig) {
        if let Ok(mut slot) = self.config.lock() {
            *slot = config;
        }
    }

    /// Gates one normalized envelope and hands admitted ones to the
    /// scheduler.
    pub async fn accept(&self, envelope: ChannelEnvelope) -> Result<IngressOutcome> {
        envelope.validate()?;
        let config = self
            .config
            .lock()
            .map(|config| config.clone())
            .expect("ingress config lock poisoned");

        let channel_id = envelope.surface.as_str();
        let section = config.channel(channel_id);
        let mention_patterns = config.mention_patterns_for_channel(channel_id);
        let decision = evaluate_inbound_policy(&section, &mention_patterns, &envelope);

        match decision {
            PolicyDecision::Allow { reason_code } => {
                debug!(
                    target: "clawdis.ingress",
                    channel = channel_id,
                    reason = %reason_code,
                    "envelope admitted"
                );
                let session_key = self.scheduler.handle_inbound(envelope).await?;
                Ok(IngressOutcome::Dispatched { session_key })
            }
            PolicyDecision::Deny { reason_code } => {
                debug!(
                    target: "clawdis.ingress",
                    channel = channel_id,
                    reason = %reason_code,
                    "envelope denied"
                );
                Ok(IngressOutcome::Denied { reason_code })
            }
            PolicyDecision::DenyStoreContext { reason_code } => {
                self.store_context_only(&config, &envelope)?;
                Ok(IngressOutcome::StoredContext { reason_code })
            }
            PolicyDecision::PairingRequired { .. } => {
                let code = self.start_pairing(channel_id, &envelope.from)?;
                Ok(IngressOutcome::PairingStarted { code })
            }
        }
    }

    /// Mention-gated group messages stay visible as context without
    /// starting a run.
    fn store_context_only(
        &self,
        config: &ClawdisConfig,
        envelope: &ChannelEnvelope,
    ) -> Result<()> {
        let Some(dir) = &self.transcript_dir else {
            return Ok(());
        };
        let session_key =
            resolve_session_key(envelope, config.session.scope, &config.session.main_key);
        let session_id = self.scheduler.with_store(|store| {
            store
                .ensure_entry(&session_key)
                .map(|entry| entry.session_id)
        })?;
        append_transcript(
            &dir.join(format!("{session_id}.jsonl")),
            &TranscriptRecord {
                timestamp_unix_ms: unix_time_ms(),
                role: "context".to_string(),
                text: envelope.body.clone(),
                run_id: None,
                channel: Some(envelope.surface.as_str().to_string()),
            },
        )
    }

    fn start_pairing(&self, channel_id: &str, peer: &str) -> Result<String> {
        let mut store = PairingStore::open(
            self.credentials_dir
                .join(format!("{channel_id}-pairing.json")),
            channel_id,
        )?;
        let request = store.create_request(peer, unix_time_secs())?;
        info!(
            target: "clawdis.ingress",
            channel = channel_id,
            peer = %peer,
            "pairing request pending"
        );
        Ok(request.code)
    }
}
