//! WhatsApp adapter.
//!
//! Readiness is stricter than other surfaces: heartbeats require linked
//! credentials and a running listener, and non-wildcard allowlists pin
//! heartbeat targets to an allowlisted number.

use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use clawdis_config::ChannelSection;
use tracing::info;

use crate::channel_contract::{
    AccountContext, ChannelAdapter, ChannelCapabilities, ChannelDock, ChannelRuntimeStatus,
    HeartbeatReadiness, SendError, SendReceipt, StatusHandle, TransportCell, TransportFactory,
};
use crate::channel_envelope::{ChannelSurface, ChatType};
use crate::channel_media::PreparedMedia;
use crate::channel_policy::WILDCARD_ALLOW;

pub const WHATSAPP_TEXT_CHUNK_LIMIT: usize = 4_000;

pub struct WhatsappAdapter {
    transport: TransportCell,
    transport_factory: Option<TransportFactory>,
    auth_path: Mutex<Option<PathBuf>>,
    status: StatusHandle,
}

impl WhatsappAdapter {
    pub fn new(transport_factory: Option<TransportFactory>) -> Self {
        Self {
            transport: TransportCell::default(),
            transport_factory,
            auth_path: Mutex::new(None),
            status: StatusHandle::default(),
        }
    }

    /// Points the adapter at its credential file for link checks.
    pub fn set_auth_path(&self, path: PathBuf) {
        if let Ok(mut slot) = self.auth_path.lock() {
            *slot = Some(path);
        }
    }

    pub fn status(&self) -> StatusHandle {
        self.status.clone()
    }

    fn is_linked(&self) -> bool {
        self.auth_path
            .lock()
            .ok()
            .and_then(|slot| slot.clone())
            .map(|path| path.exists())
            .unwrap_or(false)
    }
}

#[async_trait]
impl ChannelAdapter for WhatsappAdapter {
    fn dock(&self) -> ChannelDock {
        ChannelDock {
            id: ChannelSurface::Whatsapp,
            label: "WhatsApp",
            order: 1,
            force_account_binding: true,
            prefer_session_lookup_for_announce_target: true,
            quickstart_allow_from: true,
            show_configured: true,
        }
    }

    fn capabilities(&self) -> ChannelCapabilities {
        ChannelCapabilities {
            chat_types: vec![ChatType::Direct, ChatType::Group],
            media: true,
            polls: true,
            native_commands: false,
            block_streaming_default: true,
            text_chunk_limit: WHATSAPP_TEXT_CHUNK_LIMIT,
            poll_max_options: 12,
            voice_notes: true,
        }
    }

    async fn send_text(
        &self,
        target: &str,
        text: &str,
        _reply_to_id: Option<&str>,
    ) -> Result<SendReceipt, SendError> {
        let transport = self.transport.get(ChannelSurface::Whatsapp)?;
        let provider_message_id = transport.send_text(target, text).await?;
        Ok(SendReceipt {
            surface: ChannelSurface::Whatsapp,
            target: target.to_string(),
            provider_message_id: Some(provider_message_id),
            chunk_index: 0,
            chunk_count: 1,
        })
    }

    async fn send_media(
        &self,
        target: &str,
        media: &PreparedMedia,
        caption: Option<&str>,
    ) -> Result<SendReceipt, SendError> {
        let transport = self.transport.get(ChannelSurface::Whatsapp)?;
        let provider_message_id = transport.send_media(target, media, caption).await?;
        Ok(SendReceipt {
            surface: ChannelSurface::Whatsapp,
            target: target.to_string(),
            provider_message_id: Some(provider_message_id),
            chunk_index: 0,
            chunk_count: 1,
        })
    }

    async fn send_poll(
        &self,
        target: &str,
        question: &str,
        options: &[String],
    ) -> Result<SendReceipt, SendError> {
        let transport = self.transport.get(ChannelSurface::Whatsapp)?;
        let provider_message_id = transport.send_poll(target, question, options).await?;
        Ok(SendReceipt {
            surface: ChannelSurface::Whatsapp,
            target: target.to_string(),
            provider_message_id: Some(provider_message_id),
            chunk_index: 0,
            chunk_count: 1,
        })
    }

    async fn start_account(&self, ctx: &AccountContext) -> Result<()> {
        ctx.status.set(ChannelRuntimeStatus::Starting);
        match &self.transport_factory {
            Some(factory) => {
                let transport = factory(ctx)?;
                self.transport.set(Some(transport));
                ctx.status.set(ChannelRuntimeStatus::Running);
                self.status.set(ChannelRuntimeStatus::Running);
                info!(target: "clawdis.channel", account = %ctx.account_id, "whatsapp account started");
            }
            None => {
                ctx.status.set(ChannelRuntimeStatus::NotLinked);
                self.status.set(ChannelRuntimeStatus::NotLinked);
            }
        }
        Ok(())
    }

    async fn stop_account(&self, ctx: &AccountContext) -> Result<()> {
        self.transport.set(None);
        ctx.status.set(ChannelRuntimeStatus::Stopped);
        self.status.set(ChannelRuntimeStatus::Stopped);
        Ok(())
    }

    fn heartbeat_readiness(&self, section: &ChannelSection) -> HeartbeatReadiness {
        if !section.enabled {
            return HeartbeatReadiness::Skip {
                reason: "whatsapp-disabled".to_string(),
            };
        }
        if !self.is_linked() {
            return HeartbeatReadiness::Skip {
                reason: "whatsapp-not-linked".to_string(),
            };
        }
        if self.status.get() != ChannelRuntimeStatus::Running {
            return HeartbeatReadiness::Skip {
                reason: "whatsapp-not-running".to_string(),
            };
        }
        HeartbeatReadiness::Ready
    }

    fn resolve_heartbeat_target(
        &self,
        section: &ChannelSection,
        explicit_to: Option<&str>,
        last_to: Option<&str>,
    ) -> (Option<String>, Option<String>) {
        let candidate = explicit_to
            .or(last_to)
            .map(str::trim)
            .filter(|to| !to.is_empty())
            .map(str::to_string);

        let allowlist = &section.allow_from;
        let wildcard = allowlist.iter().any(|entry| entry.trim() == WILDCARD_ALLOW);
        if wildcard || allowlist.is_empty() {
            return (candidate, None);
        }

        match candidate {
            Some(to) if allowlist.iter().any(|entry| entry.trim() == to) => (Some(to), None),
            _ => {
                let fallback = allowlist
                    .iter()
                    .map(|entry| entry.trim())
                    .find(|entry| !entry.is_empty() && *entry != WILDCARD_ALLOW)
                    .map(str::to_string);
                let reason = fallback.as_ref().map(|_| "allowFrom-fallback".to_string());
                (fallback, reason)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use clawdis_config::ChannelSection;

    use super::WhatsappAdapter;
    use crate::channel_contract::{ChannelAdapter, ChannelRuntimeStatus, HeartbeatReadiness};

    fn enabled_section(allow_from: &[&str]) -> ChannelSection {
        ChannelSection {
            enabled: true,
            allow_from: allow_from.iter().map(|s| s.to_string()).collect(),
            ..ChannelSection::default()
        }
    }

    #[test]
    fn unit_heartbeat_readiness_reports_not_linked_without_auth_file() {
        let adapter = WhatsappAdapter::new(None);
        adapter.set_auth_path("/nonexistent/whatsapp-auth.json".into());
        assert_eq!(
            adapter.heartbeat_readiness(&enabled_section(&[])),
            HeartbeatReadiness::Skip {
                reason: "whatsapp-not-linked".to_string()
            }
        );
    }

    #[test]
    fn unit_heartbeat_readiness_reports_disabled_before_link_state() {
        let adapter = WhatsappAdapter::new(None);
        assert_eq!(
            adapter.heartbeat_readiness(&ChannelSection::default()),
            HeartbeatReadiness::Skip {
                reason: "whatsapp-disabled".to_string()
            }
        );
    }

    #[test]
    fn functional_heartbeat_readiness_requires_running_listener() {
        let temp = tempfile::tempdir().expect("tempdir");
        let auth = temp.path().join("whatsapp-auth.json");
        std::fs::write(&auth, "{}").expect("write auth");

        let adapter = WhatsappAdapter::new(None);
        adapter.set_auth_path(auth);
        assert_eq!(
            adapter.heartbeat_readiness(&enabled_section(&[])),
            HeartbeatReadiness::Skip {
                reason: "whatsapp-not-running".to_string()
            }
        );

        adapter.status().set(ChannelRuntimeStatus::Running);
        assert_eq!(
            adapter.heartbeat_readiness(&enabled_section(&[])),
            HeartbeatReadiness::Ready
        );
    }

    #[test]
    fn functional_non_wildcard_allowlist_substitutes_first_entry() {
        let adapter = WhatsappAdapter::new(None);
        let section = enabled_section(&["+15555550123", "+15555550999"]);
        let (target, reason) =
            adapter.resolve_heartbeat_target(&section, Some("+19998887777"), None);
        assert_eq!(target.as_deref(), Some("+15555550123"));
        assert_eq!(reason.as_deref(), Some("allowFrom-fallback"));
    }

    #[test]
    fn regression_wildcard_allowlist_keeps_requested_target() {
        let adapter = WhatsappAdapter::new(None);
        let section = enabled_section(&["*"]);
        let (target, reason) =
            adapter.resolve_heartbeat_target(&section, Some("+19998887777"), None);
        assert_eq!(target.as_deref(), Some("+19998887777"));
        assert!(reason.is_none());
    }
}
