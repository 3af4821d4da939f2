//! iMessage adapter. Delivery rides the local Messages bridge; polls and
//! voice notes are unsupported.

use anyhow::Result;
use async_trait::async_trait;

use crate::channel_contract::{
    AccountContext, ChannelAdapter, ChannelCapabilities, ChannelDock, ChannelRuntimeStatus,
    SendError, SendReceipt, TransportCell, TransportFactory,
};
use crate::channel_envelope::{ChannelSurface, ChatType};
use crate::channel_media::PreparedMedia;

pub const IMESSAGE_TEXT_CHUNK_LIMIT: usize = 4_000;

pub struct ImessageAdapter {
    transport: TransportCell,
    transport_factory: Option<TransportFactory>,
}

impl ImessageAdapter {
    pub fn new(transport_factory: Option<TransportFactory>) -> Self {
        Self {
            transport: TransportCell::default(),
            transport_factory,
        }
    }
}

#[async_trait]
impl ChannelAdapter for ImessageAdapter {
    fn dock(&self) -> ChannelDock {
        ChannelDock {
            id: ChannelSurface::Imessage,
            label: "iMessage",
            order: 5,
            force_account_binding: true,
            prefer_session_lookup_for_announce_target: false,
            quickstart_allow_from: false,
            show_configured: false,
        }
    }

    fn capabilities(&self) -> ChannelCapabilities {
        ChannelCapabilities {
            chat_types: vec![ChatType::Direct, ChatType::Group],
            media: true,
            polls: false,
            native_commands: false,
            block_streaming_default: true,
            text_chunk_limit: IMESSAGE_TEXT_CHUNK_LIMIT,
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
        let transport = self.transport.get(ChannelSurface::Imessage)?;
        let provider_message_id = transport.send_text(target, text).await?;
        Ok(SendReceipt {
            surface: ChannelSurface::Imessage,
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
        let transport = self.transport.get(ChannelSurface::Imessage)?;
        let provider_message_id = transport.send_media(target, media, caption).await?;
        Ok(SendReceipt {
            surface: ChannelSurface::Imessage,
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
