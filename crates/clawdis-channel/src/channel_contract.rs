//! The channel adapter contract.
//!
//! Adapters are a closed set of variants, each implementing this fixed
//! capability interface. Optional capability groups are exposed through
//! accessor methods returning `Option`, so shared code can query support
//! without knowing concrete types. Heavy transport wiring is deferred behind
//! `start_account`; the cheap `dock` is always safe to call.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use clawdis_config::{ChannelSection, DmPolicy};
use serde::Serialize;

use crate::channel_chunker::chunk_markdown_text;
use crate::channel_envelope::{ChannelEnvelope, ChannelSurface, ChatType};
use crate::channel_media::PreparedMedia;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
/// Cheap, cycle-safe adapter metadata usable from shared modules.
pub struct ChannelDock {
    pub id: ChannelSurface,
    pub label: &'static str,
    pub order: u8,
    pub force_account_binding: bool,
    pub prefer_session_lookup_for_announce_target: bool,
    pub quickstart_allow_from: bool,
    pub show_configured: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
/// Public struct `ChannelCapabilities` used across Clawdis components.
pub struct ChannelCapabilities {
    pub chat_types: Vec<ChatType>,
    pub media: bool,
    pub polls: bool,
    pub native_commands: bool,
    pub block_streaming_default: bool,
    pub text_chunk_limit: usize,
    pub poll_max_options: usize,
    pub voice_notes: bool,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `DeliveryMode` values.
pub enum DeliveryMode {
    TextOnly,
    MediaCapable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// How a target is being resolved for an outbound send.
pub enum TargetMode {
    Reply,
    Announce,
    Heartbeat,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `SendErrorKind` values.
pub enum SendErrorKind {
    RateLimit,
    TransientNetwork,
    MarkdownParse,
    NotLinked,
    ChatNotFound,
    Permanent,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind:?}: {message}")]
/// Adapter send failure, classified for the retry policy.
pub struct SendError {
    pub kind: SendErrorKind,
    pub message: String,
}

impl SendError {
    pub fn new(kind: SendErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Classifies a raw transport failure message into a send-error kind.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lowered = message.to_ascii_lowercase();
        let kind = if lowered.contains("429") || lowered.contains("too many requests") {
            SendErrorKind::RateLimit
        } else if ["timeout", "connect", "reset", "closed", "unavailable", "temporarily"]
            .iter()
            .any(|needle| lowered.contains(needle))
        {
            SendErrorKind::TransientNetwork
        } else if lowered.contains("can't parse entities") || lowered.contains("parse entities") {
            SendErrorKind::MarkdownParse
        } else if lowered.contains("chat not found") {
            SendErrorKind::ChatNotFound
        } else {
            SendErrorKind::Permanent
        };
        Self { kind, message }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            SendErrorKind::RateLimit | SendErrorKind::TransientNetwork
        )
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
/// Receipt for one delivered fragment.
pub struct SendReceipt {
    pub surface: ChannelSurface,
    pub target: String,
    pub provider_message_id: Option<String>,
    pub chunk_index: usize,
    pub chunk_count: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `ChannelRuntimeStatus` values.
pub enum ChannelRuntimeStatus {
    #[default]
    Stopped,
    Starting,
    Running,
    NotLinked,
    Error(String),
}

impl ChannelRuntimeStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::NotLinked => "not-linked",
            Self::Error(_) => "error",
        }
    }
}

#[derive(Debug, Clone, Default)]
/// Shared get/set status cell handed to lifecycle hooks.
pub struct StatusHandle {
    inner: Arc<Mutex<ChannelRuntimeStatus>>,
}

impl StatusHandle {
    pub fn get(&self) -> ChannelRuntimeStatus {
        self.inner.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn set(&self, status: ChannelRuntimeStatus) {
        if let Ok(mut slot) = self.inner.lock() {
            *slot = status;
        }
    }
}

#[derive(Debug, Clone)]
/// Runtime context passed to `start_account` / `stop_account`.
pub struct AccountContext {
    pub account_id: String,
    pub status: StatusHandle,
}

impl AccountContext {
    pub fn new(account_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            status: StatusHandle::default(),
        }
    }
}

/// Seam for the concrete transport of a surface (Baileys, grammY, ...).
///
/// Adapters receive an implementation at `start_account` time; until then
/// sends fail with `NotLinked`.
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    async fn send_text(&self, target: &str, text: &str) -> Result<String, SendError>;

    /// Same content without any markup parse mode.
    async fn send_text_plain(&self, target: &str, text: &str) -> Result<String, SendError> {
        self.send_text(target, text).await
    }
    async fn send_media(
        &self,
        target: &str,
        media: &PreparedMedia,
        caption: Option<&str>,
    ) -> Result<String, SendError>;
    async fn send_poll(
        &self,
        target: &str,
        question: &str,
        options: &[String],
    ) -> Result<String, SendError> {
        let _ = (target, question, options);
        Err(SendError::new(
            SendErrorKind::Permanent,
            "polls are not supported on this surface",
        ))
    }
    async fn probe(&self) -> Result<()> {
        Ok(())
    }
}

/// Lazily-wired transport slot.
///
/// Empty until `start_account` runs; sends through an empty cell fail with
/// `NotLinked` instead of panicking.
#[derive(Default)]
pub struct TransportCell {
    inner: Mutex<Option<Arc<dyn ChannelTransport>>>,
}

impl TransportCell {
    pub fn set(&self, transport: Option<Arc<dyn ChannelTransport>>) {
        if let Ok(mut slot) = self.inner.lock() {
            *slot = transport;
        }
    }

    pub fn get(&self, surface: ChannelSurface) -> Result<Arc<dyn ChannelTransport>, SendError> {
        self.inner
            .lock()
            .ok()
            .and_then(|slot| slot.clone())
            .ok_or_else(|| {
                SendError::new(
                    SendErrorKind::NotLinked,
                    format!("{} transport is not linked", surface.as_str()),
                )
            })
    }

    pub fn is_linked(&self) -> bool {
        self.inner
            .lock()
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }
}

impl std::fmt::Debug for TransportCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportCell")
            .field("linked", &self.is_linked())
            .finish()
    }
}

/// Factory invoked at `start_account` time so heavy transport wiring stays
/// out of process startup.
pub type TransportFactory =
    Arc<dyn Fn(&AccountContext) -> Result<Arc<dyn ChannelTransport>> + Send + Sync>;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "state")]
/// Readiness verdict for heartbeat delivery on a channel.
pub enum HeartbeatReadiness {
    Ready,
    Skip { reason: String },
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
/// One actionable status problem reported by an adapter.
pub struct StatusIssue {
    pub surface: ChannelSurface,
    pub code: String,
    pub message: String,
}

/// The polymorphic unit the gateway consumes.
///
/// Required methods cover meta, capabilities, outbound, and lifecycle; the
/// optional groups default to "unsupported" so thin surfaces stay thin.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn dock(&self) -> ChannelDock;

    fn capabilities(&self) -> ChannelCapabilities;

    fn delivery_mode(&self) -> DeliveryMode {
        if self.capabilities().media {
            DeliveryMode::MediaCapable
        } else {
            DeliveryMode::TextOnly
        }
    }

    /// Splits reply text into fragments honoring the channel cap. Fenced code
    /// spans are never split across fragments.
    fn chunk_text(&self, text: &str) -> Vec<String> {
        chunk_markdown_text(text, self.capabilities().text_chunk_limit)
    }

    /// Resolves the outbound target for an envelope, honoring allowlists.
    fn resolve_target(
        &self,
        envelope: Option<&ChannelEnvelope>,
        explicit_to: Option<&str>,
        mode: TargetMode,
        allow_from: &[String],
    ) -> Option<String> {
        if let Some(to) = explicit_to.map(str::trim).filter(|to| !to.is_empty()) {
            return Some(to.to_string());
        }
        if let Some(envelope) = envelope {
            return Some(envelope.from.clone());
        }
        if matches!(mode, TargetMode::Announce | TargetMode::Heartbeat) {
            return allow_from
                .iter()
                .map(|entry| entry.trim())
                .find(|entry| !entry.is_empty() && *entry != "*")
                .map(str::to_string);
        }
        None
    }

    async fn send_text(
        &self,
        target: &str,
        text: &str,
        reply_to_id: Option<&str>,
    ) -> Result<SendReceipt, SendError>;

    async fn send_media(
        &self,
        target: &str,
        media: &PreparedMedia,
        caption: Option<&str>,
    ) -> Result<SendReceipt, SendError>;

    async fn send_poll(
        &self,
        target: &str,
        question: &str,
        options: &[String],
    ) -> Result<SendReceipt, SendError> {
        let _ = (target, question, options);
        Err(SendError::new(
            SendErrorKind::Permanent,
            "polls are not supported on this surface",
        ))
    }

    /// Whether sends should retry a failed Markdown chunk as plain text.
    fn markdown_fallback(&self) -> bool {
        false
    }

    /// Sends a chunk without any markup parse mode. Surfaces that render
    /// Markdown natively override this to bypass their parser.
    async fn send_text_plain(
        &self,
        target: &str,
        text: &str,
        reply_to_id: Option<&str>,
    ) -> Result<SendReceipt, SendError> {
        self.send_text(target, text, reply_to_id).await
    }

    fn resolve_dm_policy(&self, section: &ChannelSection) -> DmPolicy {
        section.dm_policy
    }

    fn collect_warnings(&self, section: &ChannelSection) -> Vec<String> {
        let _ = section;
        Vec::new()
    }

    fn collect_status_issues(&self, section: &ChannelSection) -> Vec<StatusIssue> {
        let _ = section;
        Vec::new()
    }

    /// Config path prefixes whose mutation triggers a hot restart of this
    /// adapter only.
    fn config_prefixes(&self) -> Vec<String> {
        vec![format!("channels.{}", self.dock().id.as_str())]
    }

    /// Whether the channel has everything it needs to start an account.
    fn is_configured(&self, section: &ChannelSection) -> bool {
        section.enabled
    }

    /// Starts a QR login flow, returning the QR payload to render. Surfaces
    /// without QR pairing return `None`.
    async fn login_with_qr_start(&self, ctx: &AccountContext) -> Result<Option<String>> {
        let _ = ctx;
        Ok(None)
    }

    /// Waits for an in-flight QR login to complete.
    async fn login_with_qr_wait(&self, ctx: &AccountContext) -> Result<bool> {
        let _ = ctx;
        Ok(false)
    }

    /// Drops any stored transport session for the account.
    async fn logout_account(&self, ctx: &AccountContext) -> Result<()> {
        self.stop_account(ctx).await
    }

    async fn start_account(&self, ctx: &AccountContext) -> Result<()>;

    async fn stop_account(&self, ctx: &AccountContext) -> Result<()>;

    /// Heartbeat readiness; adapters without special requirements are always
    /// ready when enabled.
    fn heartbeat_readiness(&self, section: &ChannelSection) -> HeartbeatReadiness {
        if section.enabled {
            HeartbeatReadiness::Ready
        } else {
            HeartbeatReadiness::Skip {
                reason: format!("{}-disabled", self.dock().id.as_str()),
            }
        }
    }

    /// Heartbeat target resolution when the channel owns targeting. Returns
    /// `(target, reason)`; the reason names any substitution performed.
    fn resolve_heartbeat_target(
        &self,
        section: &ChannelSection,
        explicit_to: Option<&str>,
        last_to: Option<&str>,
    ) -> (Option<String>, Option<String>) {
        let _ = section;
        let target = explicit_to
            .or(last_to)
            .map(str::trim)
            .filter(|to| !to.is_empty())
            .map(str::to_string);
        (target, None)
    }
}

#[cfg(test)]
mod tests {
    use super::{SendError, SendErrorKind};

    #[test]
    fn unit_send_error_classification_matches_transient_patterns() {
        for message in [
            "HTTP 429 from provider",
            "connection reset by peer",
            "request timeout",
            "socket closed",
            "service temporarily unavailable",
        ] {
            let error = SendError::classify(message);
            assert!(error.is_retryable(), "{message} should be retryable");
        }
    }

    #[test]
    fn unit_send_error_classification_flags_markdown_and_permanent() {
        assert_eq!(
            SendError::classify("Bad Request: can't parse entities").kind,
            SendErrorKind::MarkdownParse
        );
        assert_eq!(
            SendError::classify("Bad Request: chat not found").kind,
            SendErrorKind::ChatNotFound
        );
        assert_eq!(
            SendError::classify("invalid token").kind,
            SendErrorKind::Permanent
        );
        assert!(!SendError::classify("invalid token").is_retryable());
    }
}
