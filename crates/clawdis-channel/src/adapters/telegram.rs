//! Telegram adapter.
//!
//! Telegram renders Markdown natively, so failed parses fall back to plain
//! text. Forum-topic threading is resolved upstream by the session key
//! resolver; the adapter only carries the thread id on sends.

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use crate::channel_contract::{
    AccountContext, ChannelAdapter, ChannelCapabilities, ChannelDock, ChannelRuntimeStatus,
    SendError, SendReceipt, TransportCell, TransportFactory,
};
use crate::channel_envelope::{ChannelSurface, ChatType};
use crate::channel_media::PreparedMedia;

pub const TELEGRAM_TEXT_CHUNK_LIMIT: usize = 4_096;

pub struct TelegramAdapter {
    transport: TransportCell,
    transport_factory: Option<TransportFactory>,
}

impl TelegramAdapter {
    pub fn new(transport_factory: Option<TransportFactory>) -> Self {
        Self {
            transport: TransportCell::default(),
            transport_factory,
        }
    }
}

#[async_trait]
impl ChannelAdapter for TelegramAdapter {
    fn dock(&self) -> ChannelDock {
        ChannelDock {
            id: ChannelSurface::Telegram,
            label: "Telegram",
            order: 2,
            force_account_binding: false,
            prefer_session_lookup_for_announce_target: false,
            quickstart_allow_from: true,
            show_configured: true,
        }
    }

    fn capabilities(&self) -> ChannelCapabilities {
        ChannelCapabilities {
            chat_types: vec![ChatType::Direct, ChatType::Group, ChatType::Channel],
            media: true,
            polls: true,
            native_commands: true,
            block_streaming_default: false,
            text_chunk_limit: TELEGRAM_TEXT_CHUNK_LIMIT,
            poll_max_options: 10,
            voice_notes: true,
        }
    }

    fn markdown_fallback(&self) -> bool {
        true
    }

    async fn send_text(
        &self,
        target: &str,
        text: &str,
        _reply_to_id: Option<&str>,
    ) -> Result<SendReceipt, SendError> {
        let transport = self.transport.get(ChannelSurface::Telegram)?;
        let provider_message_id = transport.send_text(target, text).await?;
        Ok(SendReceipt {
            surface: ChannelSurface::Telegram,
            target: target.to_string(),
            provider_message_id: Some(provider_message_id),
            chunk_index: 0,
            chunk_count: 1,
        })
    }

    async fn send_text_plain(
        &self,
        target: &str,
        text: &str,
        _reply_to_id: Option<&str>,
    ) -> Result<SendReceipt, SendError> {
        let transport = self.transport.get(ChannelSurface::Telegram)?;
        let provider_message_id = transport.send_text_plain(target, text).await?;
        Ok(SendReceipt {
            surface: ChannelSurface::Telegram,
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
        let transport = self.transport.get(ChannelSurface::Telegram)?;
        let provider_message_id = transport.send_media(target, media, caption).await?;
        Ok(SendReceipt {
            surface: ChannelSurface::Telegram,
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
        let transport = self.transport.get(ChannelSurface::Telegram)?;
        let provider_message_id = transport.send_poll(target, question, options).await?;
        Ok(SendReceipt {
            surface: ChannelSurface::Telegram,
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
                info!(target: "clawdis.channel", account = %ctx.account_id, "telegram account started");
            }
            None => ctx.status.set(ChannelRuntimeStatus::NotLinked),
        }
        Ok(())
    }

    async fn stop_account(&self, ctx: &AccountContext) -> Result<()> {
        self.transport.set(None);
        ctx.status.set(ChannelRuntimeStatus::Stopped);
        Ok(())
    }
}
