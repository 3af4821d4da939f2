//! OpenAI-compatible HTTP chat engine.
//!
//! One request per run; steer turns received before the request fires are
//! folded into the prompt. Cancellation aborts the in-flight request and
//! reports `Aborted` instead of an error.

use anyhow::{Context, Result};
use async_trait::async_trait;
use clawdis_runtime::{
    AgentEngine, AgentRunRequest, AgentStreamEvent, CancellationFlag, RunMeta, RunOutcome,
    RunPayload,
};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::debug;

const DEFAULT_API_BASE: &str = "http://127.0.0.1:11434/v1";
const DEFAULT_MODEL: &str = "llama3.1";

#[derive(Debug, Clone)]
pub struct HttpChatEngineConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout_ms: u64,
}

impl HttpChatEngineConfig {
    /// Environment first, then config model, then local defaults.
    pub fn resolve(config_model: Option<&str>) -> Self {
        let base_url = std::env::var("CLAWDIS_API_BASE")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        let api_key = std::env::var("CLAWDIS_API_KEY")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        let model = std::env::var("CLAWDIS_MODEL")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .or_else(|| config_model.map(str::to_string))
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());
        Self {
            base_url,
            api_key,
            model,
            timeout_ms: 120_000,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize, Default)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

pub struct HttpChatEngine {
    client: reqwest::Client,
    config: HttpChatEngineConfig,
}

impl HttpChatEngine {
    pub fn new(config: HttpChatEngineConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(config.timeout_ms.max(1)))
            .build()
            .context("failed to build chat engine http client")?;
        Ok(Self { client, config })
    }

    async fn complete(&self, prompt: &str) -> Result<(String, RunMeta)> {
        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let mut request = self.client.post(&url).json(&json!({
            "model": self.config.model,
            "messages": [{ "role": "user", "content": prompt }],
        }));
        if let Some(api_key) = &self.config.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("chat completion request to {url} failed"))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .context("failed to read chat completion body")?;
        if !status.is_success() {
            anyhow::bail!("chat completion returned {status}: {body}");
        }

        let parsed = serde_json::from_str::<ChatCompletionResponse>(&body)
            .context("failed to parse chat completion response")?;
        let content = parsed
            .choices
            .first()
            .map(|choice| choice.message.content.clone())
            .unwrap_or_default();
        let usage = parsed.usage.unwrap_or_default();
        Ok((
            content,
            RunMeta {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
                model: parsed.model.or_else(|| Some(self.config.model.clone())),
                context_tokens: None,
            },
        ))
    }
}

fn is_context_overflow(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    lowered.contains("context_length") || lowered.contains("maximum context")
}

#[async_trait]
impl AgentEngine for HttpChatEngine {
    async fn run(
        &self,
        mut request: AgentRunRequest,
        events: mpsc::UnboundedSender<AgentStreamEvent>,
        cancel: CancellationFlag,
    ) -> Result<RunOutcome> {
        // Fold any already-queued steer turns into the prompt.
        let mut prompt = request.prompt.clone();
        while let Ok(turn) = request.steer.try_recv() {
            prompt.push_str("\n\n");
            prompt.push_str(&turn);
        }

        let outcome = tokio::select! {
            result = self.complete(&prompt) => result,
            _ = cancel.cancelled() => return Ok(RunOutcome::Aborted),
        };
        match outcome {
            Ok((content, meta)) => {
                debug!(
                    target: "clawdis.engine",
                    session_key = %request.session_key,
                    output_tokens = meta.output_tokens,
                    "chat completion finished"
                );
                let _ = events.send(AgentStreamEvent::AssistantMessage {
                    text: content.clone(),
                });
                Ok(RunOutcome::Final {
                    payloads: vec![RunPayload::from_raw_text(&content)],
                    meta,
                })
            }
            Err(error) => {
                let message = format!("{error:#}");
                if is_context_overflow(&message) {
                    Ok(RunOutcome::ContextOverflow)
                } else {
                    Ok(RunOutcome::Error { message })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use clawdis_runtime::{AgentEngine, AgentRunRequest, CancellationFlag, RunOutcome};
    use httpmock::prelude::*;
    use tokio::sync::mpsc;

    use super::{is_context_overflow, HttpChatEngine, HttpChatEngineConfig};

    fn engine_for(base_url: String) -> HttpChatEngine {
        HttpChatEngine::new(HttpChatEngineConfig {
            base_url,
            api_key: None,
            model: "test-model".to_string(),
            timeout_ms: 5_000,
        })
        .expect("engine")
    }

    fn request(prompt: &str) -> (AgentRunRequest, mpsc::UnboundedSender<String>) {
        let (steer_tx, steer_rx) = mpsc::unbounded_channel();
        (
            AgentRunRequest {
                session_key: "main".to_string(),
                prompt: prompt.to_string(),
                thinking_level: None,
                steer: steer_rx,
            },
            steer_tx,
        )
    }

    #[tokio::test]
    async fn functional_completion_extracts_content_and_usage() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/chat/completions");
                then.status(200).json_body(serde_json::json!({
                    "model": "test-model",
                    "choices": [
                        { "message": { "role": "assistant", "content": "hello from the model" } }
                    ],
                    "usage": { "prompt_tokens": 12, "completion_tokens": 4 }
                }));
            })
            .await;

        let engine = engine_for(format!("{}/v1", server.base_url()));
        let (run_request, _steer) = request("say hello");
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let outcome = engine
            .run(run_request, events_tx, CancellationFlag::new())
            .await
            .expect("run");

        mock.assert_async().await;
        match outcome {
            RunOutcome::Final { payloads, meta } => {
                assert_eq!(payloads[0].text, "hello from the model");
                assert_eq!(meta.input_tokens, 12);
                assert_eq!(meta.output_tokens, 4);
            }
            other => panic!("expected final, got {other:?}"),
        }
        assert!(events_rx.recv().await.is_some(), "stream event emitted");
    }

    #[tokio::test]
    async fn regression_http_error_is_tagged_not_thrown() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/chat/completions");
                then.status(500).body("upstream exploded");
            })
            .await;

        let engine = engine_for(format!("{}/v1", server.base_url()));
        let (run_request, _steer) = request("boom");
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let outcome = engine
            .run(run_request, events_tx, CancellationFlag::new())
            .await
            .expect("run");
        assert!(matches!(outcome, RunOutcome::Error { .. }));
    }

    #[test]
    fn unit_context_overflow_detection_matches_provider_phrasing() {
        assert!(is_context_overflow(
            "This model's maximum context length is 8192 tokens"
        ));
        assert!(is_context_overflow("error code context_length_exceeded"));
        assert!(!is_context_overflow("rate limited"));
    }
}
