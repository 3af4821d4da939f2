//! The agent engine seam.
//!
//! The LLM runtime is an external collaborator: it receives one prompt plus
//! an optional stream of mid-run steer turns, emits stream events, and ends
//! in exactly one tagged outcome. Control flow stays in the tags; nothing in
//! the scheduler catches panics or exceptions to learn what happened.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use clawdis_channel::extract_media_hints;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, Notify};

/// Fixed reply returned when the engine reports a context overflow.
pub const CONTEXT_OVERFLOW_FALLBACK_REPLY: &str =
    "I hit my context limit on this conversation. Start a fresh session with /new and try again.";

#[derive(Clone, Default)]
/// Cooperative cancellation token propagated into runs.
pub struct CancellationFlag {
    inner: Arc<CancellationInner>,
}

#[derive(Default)]
struct CancellationInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent; later calls are no-ops.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once cancellation fires; returns immediately if it already
    /// has.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        let notified = self.inner.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl std::fmt::Debug for CancellationFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationFlag")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "kind")]
/// Enumerates supported `AgentStreamEvent` values.
pub enum AgentStreamEvent {
    AssistantDelta { text: String },
    AssistantMessage { text: String },
    ToolStart { name: String, args: Value },
    ToolEnd { name: String, ok: bool },
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq, Default)]
/// Token accounting and model info reported with a final outcome.
pub struct RunMeta {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_tokens: Option<u64>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq, Default)]
/// One reply payload; media is split out of the text by the runner.
pub struct RunPayload {
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media_urls: Vec<String>,
}

impl RunPayload {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            media_urls: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty() && self.media_urls.is_empty()
    }

    /// Splits `MEDIA:` hint lines into the payload's media list.
    pub fn from_raw_text(raw: &str) -> Self {
        let (text, media_urls) = extract_media_hints(raw);
        Self { text, media_urls }
    }
}

#[derive(Debug, Clone, PartialEq)]
/// Enumerates supported `RunOutcome` values.
pub enum RunOutcome {
    Final {
        payloads: Vec<RunPayload>,
        meta: RunMeta,
    },
    Aborted,
    ContextOverflow,
    Error {
        message: String,
    },
}

/// Inputs for one engine invocation.
pub struct AgentRunRequest {
    pub session_key: String,
    pub prompt: String,
    pub thinking_level: Option<String>,
    /// Mid-run user turns injected by `steer` queue mode.
    pub steer: mpsc::UnboundedReceiver<String>,
}

/// The opaque agent runtime.
///
/// Implementations may multiplex concurrent runs internally; the scheduler
/// imposes no global serialization beyond the per-session-key invariant.
#[async_trait]
pub trait AgentEngine: Send + Sync {
    async fn run(
        &self,
        request: AgentRunRequest,
        events: mpsc::UnboundedSender<AgentStreamEvent>,
        cancel: CancellationFlag,
    ) -> Result<RunOutcome>;
}

#[cfg(test)]
mod tests {
    use super::{CancellationFlag, RunPayload};

    #[tokio::test]
    async fn unit_cancellation_flag_wakes_waiters_and_is_idempotent() {
        let flag = CancellationFlag::new();
        assert!(!flag.is_cancelled());

        let waiter = {
            let flag = flag.clone();
            tokio::spawn(async move {
                flag.cancelled().await;
            })
        };
        flag.cancel();
        flag.cancel();
        waiter.await.expect("waiter resolves");
        assert!(flag.is_cancelled());
        // Waiting after the fact returns immediately.
        flag.cancelled().await;
    }

    #[test]
    fn unit_payload_from_raw_text_extracts_media_hints() {
        let payload = RunPayload::from_raw_text("here\nMEDIA:/tmp/cat.jpg");
        assert_eq!(payload.text, "here");
        assert_eq!(payload.media_urls, vec!["/tmp/cat.jpg"]);
        assert!(!payload.is_empty());
        assert!(RunPayload::from_raw_text("  ").is_empty());
    }
}
