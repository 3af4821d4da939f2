//! Webchat adapter.
//!
//! The in-house surface delivers through an in-process queue the gateway
//! drains into WebSocket events. Webchat is never a heartbeat target; the
//! heartbeat resolver filters it out before readiness is even consulted.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use clawdis_config::ChannelSection;
use tokio::sync::mpsc;

use crate::channel_contract::{
    AccountContext, ChannelAdapter, ChannelCapabilities, ChannelDock, ChannelRuntimeStatus,
    ChannelTransport, HeartbeatReadiness, SendError, SendReceipt, TransportCell,
};
use crate::channel_envelope::{ChannelSurface, ChatType};
use crate::channel_media::PreparedMedia;

pub const WEBCHAT_TEXT_CHUNK_LIMIT: usize = 16_000;

#[derive(Debug, Clone)]
/// One message surfaced to connected webchat clients.
pub struct WebchatOutbound {
    pub target: String,
    pub text: Option<String>,
    pub media_mime: Option<String>,
    pub media_bytes: usize,
}

struct WebchatQueueTransport {
    sender: mpsc::UnboundedSender<WebchatOutbound>,
}

#[async_trait]
impl ChannelTransport for WebchatQueueTransport {
    async fn send_text(&self, target: &str, text: &str) -> Result<String, SendError> {
        self.sender
            .send(WebchatOutbound {
                target: target.to_string(),
                text: Some(text.to_string()),
                media_mime: None,
                media_bytes: 0,
            })
            .map_err(|_| SendError::classify("webchat queue closed"))?;
        Ok(String::new())
    }

    async fn send_media(
        &self,
        target: &str,
        media: &PreparedMedia,
        caption: Option<&str>,
    ) -> Result<String, SendError> {
        self.sender
            .send(WebchatOutbound {
                target: target.to_string(),
                text: caption.map(str::to_string),
                media_mime: Some(media.mime.clone()),
                media_bytes: media.bytes.len(),
            })
            .map_err(|_| SendError::classify("webchat queue closed"))?;
        Ok(String::new())
    }
}

pub struct WebchatAdapter {
    transport: TransportCell,
}

impl WebchatAdapter {
    /// Builds the adapter plus the receiver the gateway drains.
    pub fn new_with_queue() -> (Self, mpsc::UnboundedReceiver<WebchatOutbound>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let adapter = Self {
            transport: TransportCell::default(),
        };
        adapter
            .transport
            .set(Some(Arc::new(WebchatQueueTransport { sender })));
        (adapter, receiver)
    }
}

#[async_trait]
impl ChannelAdapter for WebchatAdapter {
    fn dock(&self) -> ChannelDock {
        ChannelDock {
            id: ChannelSurface::Webchat,
            label: "Web chat",
            order: 7,
            force_account_binding: false,
            prefer_session_lookup_for_announce_target: false,
            quickstart_allow_from: false,
            show_configured: false,
        }
    }

    fn capabilities(&self) -> ChannelCapabilities {
        ChannelCapabilities {
            chat_types: vec![ChatType::Direct],
            media: true,
            polls: false,
            native_commands: false,
            block_streaming_default: false,
            text_chunk_limit: WEBCHAT_TEXT_CHUNK_LIMIT,
            poll_max_options: 0,
            voice_notes: false,
        }
    }

    async fn send_text(
        &self,
        target: &str,
        text: &str,
        _reply_to_id: Option<&str>,
    ) -> Result<SendReceipt, SendError> {
        let transport = self.transport.get(ChannelSurface::Webchat)?;
        transport.send_text(target, text).await?;
        Ok(SendReceipt {
            surface: ChannelSurface::Webchat,
            target: target.to_string(),
            provider_message_id: None,
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
        let transport = self.transport.get(ChannelSurface::Webchat)?;
        transport.send_media(target, media, caption).await?;
        Ok(SendReceipt {
            surface: ChannelSurface::Webchat,
            target: target.to_string(),
            provider_message_id: None,
            chunk_index: 0,
            chunk_count: 1,
        })
    }

    async fn start_account(&self, ctx: &AccountContext) -> Result<()> {
        ctx.status.set(ChannelRuntimeStatus::Running);
        Ok(())
    }

    async fn stop_account(&self, ctx: &AccountContext) -> Result<()> {
        ctx.status.set(ChannelRuntimeStatus::Stopped);
        Ok(())
    }

    fn heartbeat_readiness(&self, _section: &ChannelSection) -> HeartbeatReadiness {
        HeartbeatReadiness::Skip {
            reason: "webchat-not-a-heartbeat-target".to_string(),
        }
    }
}
