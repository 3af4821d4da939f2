//! Slack adapter. Replies prefer the originating thread when one exists.

use anyhow::Result;
use async_trait::async_trait;

use crate::channel_contract::{
    AccountContext, ChannelAdapter, ChannelCapabilities, ChannelDock, ChannelRuntimeStatus,
    SendError, SendReceipt, TargetMode, TransportCell, TransportFactory,
};
use crate::channel_envelope::{ChannelEnvelope, ChannelSurface, ChatType};
use crate::channel_media::PreparedMedia;

pub const SLACK_TEXT_CHUNK_LIMIT: usize = 4_000;

pub struct SlackAdapter {
    transport: TransportCell,
    transport_factory: Option<TransportFactory>,
}

impl SlackAdapter {
    pub fn new(transport_factory: Option<TransportFactory>) -> Self {
        Self {
            transport: TransportCell::default(),
            transport_factory,
        }
    }
}

#[async_trait]
impl ChannelAdapter for SlackAdapter {
    fn dock(&self) -> ChannelDock {
        ChannelDock {
            id: ChannelSurface::Slack,
            label: "Slack",
            order: 6,
            force_account_binding: false,
            prefer_session_lookup_for_announce_target: true,
            quickstart_allow_from: false,
            show_configured: true,
        }
    }

    fn capabilities(&self) -> ChannelCapabilities {
        ChannelCapabilities {
            chat_types: vec![ChatType::Direct, ChatType::Group, ChatType::Channel],
            media: true,
            polls: false,
            native_commands: true,
            block_streaming_default: false,
            text_chunk_limit: SLACK_TEXT_CHUNK_LIMIT,
            poll_max_options: 0,
            voice_notes: false,
        }
    }

    fn resolve_target(
        &self,
        envelope: Option<&ChannelEnvelope>,
        explicit_to: Option<&str>,
        mode: TargetMode,
        allow_from: &[String],
    ) -> Option<String> {
        // Thread replies stay in their thread; everything else follows the
        // shared resolution order.
        if matches!(mode, TargetMode::Reply) {
            if let Some(envelope) = envelope {
                if let Some(thread) = envelope.thread_id.as_deref().filter(|t| !t.is_empty()) {
                    return Some(format!("{}:{}", envelope.from, thread));
                }
            }
        }
        if let Some(to) = explicit_to.map(str::trim).filter(|to| !to.is_empty()) {
            return Some(to.to_string());
        }
        if let Some(envelope) = envelope {
            return Some(envelope.from.clone());
        }
        allow_from
            .iter()
            .map(|entry| entry.trim())
            .find(|entry| !entry.is_empty() && *entry != "*")
            .map(str::to_string)
    }

    async fn send_text(
        &self,
        target: &str,
        text: &str,
        _reply_to_id: Option<&str>,
    ) -> Result<SendReceipt, SendError> {
        let transport = self.transport.get(ChannelSurface::Slack)?;
        let provider_message_id = transport.send_text(target, text).await?;
        Ok(SendReceipt {
            surface: ChannelSurface::Slack,
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
        let transport = self.transport.get(ChannelSurface::Slack)?;
        let provider_message_id = transport.send_media(target, media, caption).await?;
        Ok(SendReceipt {
            surface: ChannelSurface::Slack,
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

#[cfg(test)]
mod tests {
    use super::SlackAdapter;
    use crate::channel_contract::{ChannelAdapter, TargetMode};
    use crate::channel_envelope::{ChannelEnvelope, ChannelSurface};

    #[test]
    fn unit_reply_target_keeps_thread_suffix() {
        let adapter = SlackAdapter::new(None);
        let envelope = ChannelEnvelope {
            thread_id: Some("171234.5678".to_string()),
            ..ChannelEnvelope::new(ChannelSurface::Slack, "C024BE91L", "hi")
        };
        let target = adapter.resolve_target(Some(&envelope), None, TargetMode::Reply, &[]);
        assert_eq!(target.as_deref(), Some("C024BE91L:171234.5678"));
    }
}
