//! Outbound delivery pipeline.
//!
//! Takes `(adapter, target, payloads)` and turns each payload into chunked
//! sends with retry on transient failures. Media captions attach to the
//! first item only; a run abort drops whatever chunks remain buffered.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, warn};

use crate::channel_contract::{ChannelAdapter, SendError, SendErrorKind, SendReceipt};
use crate::channel_envelope::OutboundPayload;
use crate::channel_media::{prepare_media, MediaLimits};

pub const SEND_MAX_ATTEMPTS: u32 = 3;
pub const SEND_BACKOFF_STEP_MS: u64 = 400;

#[derive(Debug, Clone, Default)]
/// Cooperative abort flag shared with the run scheduler.
pub struct DeliveryAbort {
    flag: Arc<AtomicBool>,
}

impl DeliveryAbort {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
/// One per-payload failure surfaced without failing the whole delivery.
pub struct DeliveryFailure {
    pub payload_index: usize,
    pub reason_code: String,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
/// Public struct `OutboundDeliveryReport` used across Clawdis components.
pub struct OutboundDeliveryReport {
    pub status: String,
    pub receipts: Vec<SendReceipt>,
    pub failures: Vec<DeliveryFailure>,
    pub dropped_chunks: usize,
    pub retried_sends: usize,
}

impl OutboundDeliveryReport {
    pub fn delivered_everything(&self) -> bool {
        self.failures.is_empty() && self.dropped_chunks == 0
    }
}

/// Delivers `payloads` in order through one adapter.
pub async fn deliver_payloads(
    adapter: &dyn ChannelAdapter,
    target: &str,
    payloads: &[OutboundPayload],
    media_max_mb: u32,
    client: &reqwest::Client,
    abort: Option<&DeliveryAbort>,
) -> Result<OutboundDeliveryReport> {
    let mut receipts = Vec::new();
    let mut failures = Vec::new();
    let mut dropped_chunks = 0usize;
    let mut retried_sends = 0usize;
    let aborted = |abort: Option<&DeliveryAbort>| abort.map(DeliveryAbort::is_aborted).unwrap_or(false);

    'payloads: for (payload_index, payload) in payloads.iter().enumerate() {
        if let Err(error) = payload.validate() {
            failures.push(DeliveryFailure {
                payload_index,
                reason_code: "invalid_payload".to_string(),
                detail: error.to_string(),
            });
            continue;
        }

        let chunks = adapter.chunk_text(&payload.text);
        let media_sources = payload.all_media();
        let reply_to = payload.reply_to_id.as_deref();

        if media_sources.is_empty() {
            for (chunk_index, chunk) in chunks.iter().enumerate() {
                if aborted(abort) {
                    dropped_chunks += chunks.len() - chunk_index;
                    break 'payloads;
                }
                match send_chunk_with_retry(adapter, target, chunk, reply_to, &mut retried_sends)
                    .await
                {
                    Ok(receipt) => receipts.push(receipt),
                    Err(error) => {
                        warn!(
                            target: "clawdis.outbound",
                            surface = adapter.dock().id.as_str(),
                            reason = ?error.kind,
                            "payload send failed"
                        );
                        failures.push(DeliveryFailure {
                            payload_index,
                            reason_code: format!("send_{:?}", error.kind).to_ascii_lowercase(),
                            detail: error.message,
                        });
                        continue 'payloads;
                    }
                }
            }
            continue;
        }

        let caption = chunks.first().cloned();
        for (media_index, source) in media_sources.iter().enumerate() {
            if aborted(abort) {
                dropped_chunks += media_sources.len() - media_index;
                break 'payloads;
            }
            let prepared = match prepare_media(
                source,
                None,
                media_max_mb,
                MediaLimits::default(),
                client,
            )
            .await
            {
                Ok(prepared) => prepared,
                Err(error) => {
                    failures.push(DeliveryFailure {
                        payload_index,
                        reason_code: "media_load_failed".to_string(),
                        detail: format!("{error:#}"),
                    });
                    continue;
                }
            };
            let caption_for_item = if media_index == 0 {
                caption.as_deref()
            } else {
                None
            };
            match send_media_with_retry(
                adapter,
                target,
                &prepared,
                caption_for_item,
                &mut retried_sends,
            )
            .await
            {
                Ok(receipt) => receipts.push(receipt),
                Err(error) => failures.push(DeliveryFailure {
                    payload_index,
                    reason_code: format!("send_{:?}", error.kind).to_ascii_lowercase(),
                    detail: error.message,
                }),
            }
        }

        // Text beyond the caption still goes out as ordinary chunks.
        for chunk in chunks.iter().skip(1) {
            if aborted(abort) {
                break 'payloads;
            }
            match send_chunk_with_retry(adapter, target, chunk, reply_to, &mut retried_sends).await
            {
                Ok(receipt) => receipts.push(receipt),
                Err(error) => {
                    failures.push(DeliveryFailure {
                        payload_index,
                        reason_code: format!("send_{:?}", error.kind).to_ascii_lowercase(),
                        detail: error.message,
                    });
                    continue 'payloads;
                }
            }
        }
    }

    let status = if aborted(abort) {
        "aborted"
    } else if failures.is_empty() {
        "sent"
    } else if receipts.is_empty() {
        "failed"
    } else {
        "partial"
    };
    debug!(
        target: "clawdis.outbound",
        status,
        receipts = receipts.len(),
        failures = failures.len(),
        dropped = dropped_chunks,
        "delivery finished"
    );

    Ok(OutboundDeliveryReport {
        status: status.to_string(),
        receipts,
        failures,
        dropped_chunks,
        retried_sends,
    })
}

async fn send_chunk_with_retry(
    adapter: &dyn ChannelAdapter,
    target: &str,
    chunk: &str,
    reply_to: Option<&str>,
    retried_sends: &mut usize,
) -> Result<SendReceipt, SendError> {
    let mut attempt = 1u32;
    loop {
        match adapter.send_text(target, chunk, reply_to).await {
            Ok(receipt) => return Ok(receipt),
            Err(error) if error.kind == SendErrorKind::MarkdownParse
                && adapter.markdown_fallback() =>
            {
                debug!(
                    target: "clawdis.outbound",
                    surface = adapter.dock().id.as_str(),
                    "markdown parse failed, retrying chunk as plain text"
                );
                return adapter.send_text_plain(target, chunk, reply_to).await;
            }
            Err(error) if error.is_retryable() && attempt < SEND_MAX_ATTEMPTS => {
                *retried_sends += 1;
                tokio::time::sleep(Duration::from_millis(
                    SEND_BACKOFF_STEP_MS * u64::from(attempt),
                ))
                .await;
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}

async fn send_media_with_retry(
    adapter: &dyn ChannelAdapter,
    target: &str,
    media: &crate::channel_media::PreparedMedia,
    caption: Option<&str>,
    retried_sends: &mut usize,
) -> Result<SendReceipt, SendError> {
    let mut attempt = 1u32;
    loop {
        match adapter.send_media(target, media, caption).await {
            Ok(receipt) => return Ok(receipt),
            Err(error) if error.is_retryable() && attempt < SEND_MAX_ATTEMPTS => {
                *retried_sends += 1;
                tokio::time::sleep(Duration::from_millis(
                    SEND_BACKOFF_STEP_MS * u64::from(attempt),
                ))
                .await;
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::channel_contract::{
        AccountContext, ChannelAdapter, ChannelCapabilities, ChannelDock, SendError,
        SendErrorKind, SendReceipt,
    };
    use crate::channel_envelope::{ChannelSurface, ChatType, OutboundPayload};
    use crate::channel_media::PreparedMedia;

    struct ScriptedAdapter {
        sent: Mutex<Vec<String>>,
        plain_sent: Mutex<Vec<String>>,
        failures_before_success: AtomicUsize,
        failure: SendError,
        markdown_fallback: bool,
    }

    impl ScriptedAdapter {
        fn reliable() -> Self {
            Self::failing(0, SendError::new(SendErrorKind::Permanent, "unused"))
        }

        fn failing(count: usize, failure: SendError) -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                plain_sent: Mutex::new(Vec::new()),
                failures_before_success: AtomicUsize::new(count),
                failure,
                markdown_fallback: false,
            }
        }
    }

    #[async_trait]
    impl ChannelAdapter for ScriptedAdapter {
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
                chat_types: vec![ChatType::Direct, ChatType::Group],
                media: true,
                polls: false,
                native_commands: false,
                block_streaming_default: false,
                text_chunk_limit: 64,
                poll_max_options: 0,
                voice_notes: false,
            }
        }

        fn markdown_fallback(&self) -> bool {
            self.markdown_fallback
        }

        async fn send_text(
            &self,
            target: &str,
            text: &str,
            _reply_to_id: Option<&str>,
        ) -> Result<SendReceipt, SendError> {
            if self.failures_before_success.load(Ordering::SeqCst) > 0 {
                self.failures_before_success.fetch_sub(1, Ordering::SeqCst);
                return Err(self.failure.clone());
            }
            self.sent.lock().expect("lock").push(text.to_string());
            Ok(SendReceipt {
                surface: ChannelSurface::Telegram,
                target: target.to_string(),
                provider_message_id: None,
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
            self.plain_sent.lock().expect("lock").push(text.to_string());
            Ok(SendReceipt {
                surface: ChannelSurface::Telegram,
                target: target.to_string(),
                provider_message_id: None,
                chunk_index: 0,
                chunk_count: 1,
            })
        }

        async fn send_media(
            &self,
            _target: &str,
            _media: &PreparedMedia,
            _caption: Option<&str>,
        ) -> Result<SendReceipt, SendError> {
            Err(SendError::new(SendErrorKind::Permanent, "no media in test"))
        }

        async fn start_account(&self, _ctx: &AccountContext) -> anyhow::Result<()> {
            Ok(())
        }

        async fn stop_account(&self, _ctx: &AccountContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn functional_text_payload_sends_every_chunk_in_order() {
        let adapter = ScriptedAdapter::reliable();
        let payloads = vec![OutboundPayload::text(format!(
            "{}\n\n{}",
            "a".repeat(50),
            "b".repeat(50)
        ))];
        let client = reqwest::Client::new();
        let report = deliver_payloads(&adapter, "chat-1", &payloads, 5, &client, None)
            .await
            .expect("deliver");
        assert_eq!(report.status, "sent");
        let sent = adapter.sent.lock().expect("lock").clone();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].starts_with('a'));
        assert!(sent[1].starts_with('b'));
    }

    #[tokio::test(start_paused = true)]
    async fn functional_transient_errors_retry_with_backoff_then_succeed() {
        let adapter = ScriptedAdapter::failing(
            2,
            SendError::classify("connection reset by peer"),
        );
        let payloads = vec![OutboundPayload::text("hello")];
        let client = reqwest::Client::new();
        let report = deliver_payloads(&adapter, "chat-1", &payloads, 5, &client, None)
            .await
            .expect("deliver");
        assert_eq!(report.status, "sent");
        assert_eq!(report.retried_sends, 2);
        assert_eq!(adapter.sent.lock().expect("lock").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn functional_transient_errors_exhaust_after_three_attempts() {
        let adapter = ScriptedAdapter::failing(
            5,
            SendError::classify("429 too many requests"),
        );
        let payloads = vec![OutboundPayload::text("hello")];
        let client = reqwest::Client::new();
        let report = deliver_payloads(&adapter, "chat-1", &payloads, 5, &client, None)
            .await
            .expect("deliver");
        assert_eq!(report.status, "failed");
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].reason_code, "send_ratelimit");
    }

    #[tokio::test]
    async fn regression_markdown_parse_error_falls_back_to_plain_text() {
        let mut adapter = ScriptedAdapter::failing(
            1,
            SendError::classify("Bad Request: can't parse entities"),
        );
        adapter.markdown_fallback = true;
        let payloads = vec![OutboundPayload::text("unbalanced _ underscore")];
        let client = reqwest::Client::new();
        let report = deliver_payloads(&adapter, "chat-1", &payloads, 5, &client, None)
            .await
            .expect("deliver");
        assert_eq!(report.status, "sent");
        assert_eq!(
            adapter.plain_sent.lock().expect("lock").as_slice(),
            ["unbalanced _ underscore"]
        );
    }

    #[tokio::test]
    async fn regression_abort_drops_buffered_chunks() {
        let adapter = ScriptedAdapter::reliable();
        let abort = DeliveryAbort::new();
        abort.abort();
        let payloads = vec![OutboundPayload::text("never delivered")];
        let client = reqwest::Client::new();
        let report = deliver_payloads(&adapter, "chat-1", &payloads, 5, &client, Some(&abort))
            .await
            .expect("deliver");
        assert_eq!(report.status, "aborted");
        assert!(adapter.sent.lock().expect("lock").is_empty());
        assert_eq!(report.dropped_chunks, 1);
    }

    #[tokio::test]
    async fn unit_invalid_payload_is_surfaced_per_payload() {
        let adapter = ScriptedAdapter::reliable();
        let payloads = vec![
            OutboundPayload::default(),
            OutboundPayload::text("still goes out"),
        ];
        let client = reqwest::Client::new();
        let report = deliver_payloads(&adapter, "chat-1", &payloads, 5, &client, None)
            .await
            .expect("deliver");
        assert_eq!(report.status, "partial");
        assert_eq!(report.failures[0].reason_code, "invalid_payload");
        assert_eq!(adapter.sent.lock().expect("lock").len(), 1);
    }
}
