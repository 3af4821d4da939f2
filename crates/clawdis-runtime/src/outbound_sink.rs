//! Default run-output sink: finished payloads go back out through the
//! originating channel adapter.

use std::sync::Arc;

use async_trait::async_trait;
use clawdis_channel::channel_outbound::DeliveryAbort;
use clawdis_channel::{
    deliver_payloads, ChannelAdapter, ChannelEnvelope, ChannelRegistry, OutboundPayload,
    TargetMode,
};
use clawdis_config::ClawdisConfig;
use tracing::{debug, warn};

use crate::agent_engine::RunPayload;
use crate::run_scheduler::RunOutputSink;

/// Public struct `ChannelOutputSink` used across Clawdis components.
pub struct ChannelOutputSink {
    channels: Arc<ChannelRegistry>,
    config: std::sync::Mutex<ClawdisConfig>,
    http: reqwest::Client,
}

impl ChannelOutputSink {
    pub fn new(channels: Arc<ChannelRegistry>, config: ClawdisConfig) -> Self {
        Self {
            channels,
            config: std::sync::Mutex::new(config),
            http: reqwest::Client::new(),
        }
    }

    pub fn update_config(&self, config: ClawdisConfig) {
        if let Ok(mut slot) = self.config.lock() {
            *slot = config;
        }
    }
}

#[async_trait]
impl RunOutputSink for ChannelOutputSink {
    async fn deliver(
        &self,
        session_key: &str,
        origin: Option<&ChannelEnvelope>,
        payloads: &[RunPayload],
        abort: &DeliveryAbort,
    ) {
        let Some(origin) = origin else {
            debug!(
                target: "clawdis.outbound",
                session_key,
                "no origin envelope; nothing to deliver"
            );
            return;
        };
        let Some(adapter) = self.channels.adapter(origin.surface) else {
            warn!(
                target: "clawdis.outbound",
                surface = origin.surface.as_str(),
                "no adapter for origin surface"
            );
            return;
        };

        let section = {
            let config = self.config.lock().expect("sink config lock poisoned");
            config.channel(origin.surface.as_str())
        };
        let Some(target) = adapter.resolve_target(
            Some(origin),
            origin.to.as_deref(),
            TargetMode::Reply,
            &section.allow_from,
        ) else {
            warn!(
                target: "clawdis.outbound",
                session_key,
                surface = origin.surface.as_str(),
                "could not resolve a reply target"
            );
            return;
        };

        let outbound = payloads
            .iter()
            .filter(|payload| !payload.is_empty())
            .map(|payload| OutboundPayload {
                text: payload.text.clone(),
                media_urls: payload.media_urls.clone(),
                reply_to_id: origin.message_id.clone(),
                thread_id: origin.thread_id.clone(),
                ..OutboundPayload::default()
            })
            .collect::<Vec<_>>();
        if outbound.is_empty() {
            return;
        }

        match deliver_payloads(
            adapter.as_ref(),
            &target,
            &outbound,
            section.media_max_mb,
            &self.http,
            Some(abort),
        )
        .await
        {
            Ok(report) => {
                if !report.delivered_everything() {
                    warn!(
                        target: "clawdis.outbound",
                        session_key,
                        status = %report.status,
                        failures = report.failures.len(),
                        "delivery incomplete"
                    );
                }
            }
            Err(error) => {
                warn!(
                    target: "clawdis.outbound",
                    session_key,
                    error = %error,
                    "delivery failed"
                );
            }
        }
    }
}
