//! Signal adapter. Text and media only; no polls, no native commands.

use anyhow::Result;
use async_trait::async_trait;

use crate::channel_contract::{
    AccountContext, ChannelAdapter, ChannelCapabilities, ChannelDock, ChannelRuntimeStatus,
    SendError, SendReceipt, TransportCell, TransportFactory,
};
use crate::channel_envelope::{ChannelSurface, ChatType};
use crate::channel_media::PreparedMedia;

pub const SIGNAL_TEXT_CHUNK_LIMIT: usize = 2_000;

pub struct SignalAdapter {
    transport: TransportCell,
    transport_factory: Option<TransportFactory>,
}

impl SignalAdapter {
    pub fn new(transport_factory: Option<TransportFactory>) -> Self {
        Self {
            transport: TransportCell::default(),
            transport_factory,
        }
    }
}

#[async_trait]
impl ChannelAdapter for SignalAdapter {
    fn dock(&self) -> ChannelDock {
        ChannelDock {
            id: ChannelSurface::Signal,
            label: "Signal",
            order: 4,
            force_account_binding: true,
            prefer_session_lookup_for_announce_target: false,
            quickstart_allow_from: true,
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
            text_chunk_limit: SIGNAL_TEXT_CHUNK_LIMIT,
            poll_max_options: 0,
            voice_notes: true,
        }
    }

    async fn send_text(
        &self,
        target: &str,
        text: &str,
        _reply_to_id: Option<&str>,
    ) -> Result<SendReceipt, SendError> {
        let transport = self.transport.get(ChannelSurface::Signal)?;
        let provider_message_id = transport.send_text(target, text).await?;
        Ok(SendReceipt {
            surface: ChannelSurface::Signal,
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
        let transport = self.transport.get(ChannelSurface::Signal)?;
        let provider_message_id = transport.send_media(target, media, caption).await?;
        Ok(SendReceipt {
            surface: ChannelSurface::Signal,
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
