//! Per-session run scheduler and queueing state machine.
//!
//! Guarantees at most one active run per session key and applies the
//! configured queue mode when new envelopes land mid-run: interrupt aborts
//! and restarts, steer injects a mid-run turn, followup/collect park the
//! envelope until the run ends. Session-store writes for a run's terminal
//! state complete before the terminal event fans out.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clawdis_channel::channel_outbound::DeliveryAbort;
use clawdis_channel::{parse_directives, ChannelEnvelope, Directive};
use clawdis_config::{ClawdisConfig, QueueMode, SessionScope};
use clawdis_core::unix_time_ms;
use clawdis_session::{
    append_transcript, resolve_session_key, SessionPatch, SessionStore, SessionUsageDelta,
    TranscriptRecord,
};
use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex};
use tracing::{debug, warn};

use crate::agent_engine::{
    AgentEngine, AgentRunRequest, AgentStreamEvent, RunMeta, RunOutcome, RunPayload,
    CONTEXT_OVERFLOW_FALLBACK_REPLY,
};
use crate::run_registry::{wait_for_terminal, ActiveRunInfo, RunRegistry, RunState};

pub const COLLECT_HISTORY_HEADER: &str = "[Chat messages since your last reply - for context]";
pub const COLLECT_CURRENT_HEADER: &str = "[Current message - respond to this]";

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
/// One parked inbound envelope.
pub struct QueuedEnvelope {
    pub envelope: ChannelEnvelope,
    pub mode: QueueMode,
    pub enqueued_at_ms: u64,
    /// Arrived while the session's previous run was aborted by a disconnect.
    pub backlog: bool,
}

#[derive(Debug, Clone)]
/// Events fanned out to the gateway and other observers.
pub enum SchedulerEvent {
    RunStarted {
        run_id: String,
        session_key: String,
    },
    Agent {
        run_id: String,
        session_key: String,
        event: AgentStreamEvent,
    },
    RunFinished {
        run_id: String,
        session_key: String,
        state: RunState,
        payloads: Vec<RunPayload>,
        error: Option<String>,
    },
}

/// Where finished payloads go. The gateway wires this to the outbound
/// delivery pipeline; tests record.
#[async_trait]
pub trait RunOutputSink: Send + Sync {
    async fn deliver(
        &self,
        session_key: &str,
        origin: Option<&ChannelEnvelope>,
        payloads: &[RunPayload],
        abort: &DeliveryAbort,
    );
}

/// Sink that drops everything; heartbeat and tests use it when delivery is
/// handled elsewhere.
pub struct NullOutputSink;

#[async_trait]
impl RunOutputSink for NullOutputSink {
    async fn deliver(
        &self,
        _session_key: &str,
        _origin: Option<&ChannelEnvelope>,
        _payloads: &[RunPayload],
        _abort: &DeliveryAbort,
    ) {
    }
}

#[derive(Clone)]
/// Public struct `SessionSchedulerConfig` used across Clawdis components.
pub struct SessionSchedulerConfig {
    pub scope: SessionScope,
    pub main_key: String,
    pub default_queue_mode: QueueMode,
    pub queue_mode_by_channel: HashMap<String, QueueMode>,
    pub transcript_dir: Option<std::path::PathBuf>,
}

impl SessionSchedulerConfig {
    pub fn from_config(config: &ClawdisConfig, transcript_dir: Option<std::path::PathBuf>) -> Self {
        Self {
            scope: config.session.scope,
            main_key: config.session.main_key.clone(),
            default_queue_mode: config.messages.queue.mode,
            queue_mode_by_channel: config
                .messages
                .queue
                .by_channel
                .iter()
                .map(|(channel, mode)| (channel.clone(), *mode))
                .collect(),
            transcript_dir,
        }
    }

    fn queue_mode_for(&self, channel: &str) -> QueueMode {
        self.queue_mode_by_channel
            .get(channel)
            .copied()
            .unwrap_or(self.default_queue_mode)
    }
}

struct SchedulerInner {
    engine: Arc<dyn AgentEngine>,
    registry: RunRegistry,
    store: std::sync::Mutex<SessionStore>,
    sink: Arc<dyn RunOutputSink>,
    events_tx: broadcast::Sender<SchedulerEvent>,
    pending: AsyncMutex<HashMap<String, VecDeque<QueuedEnvelope>>>,
    config: std::sync::Mutex<SessionSchedulerConfig>,
}

#[derive(Clone)]
/// Public struct `SessionScheduler` used across Clawdis components.
pub struct SessionScheduler {
    inner: Arc<SchedulerInner>,
}

impl SessionScheduler {
    pub fn new(
        engine: Arc<dyn AgentEngine>,
        store: SessionStore,
        sink: Arc<dyn RunOutputSink>,
        config: SessionSchedulerConfig,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(SchedulerInner {
                engine,
                registry: RunRegistry::new(),
                store: std::sync::Mutex::new(store),
                sink,
                events_tx,
                pending: AsyncMutex::new(HashMap::new()),
                config: std::sync::Mutex::new(config),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.inner.events_tx.subscribe()
    }

    pub fn update_config(&self, config: SessionSchedulerConfig) {
        if let Ok(mut slot) = self.inner.config.lock() {
            *slot = config;
        }
    }

    pub fn main_key(&self) -> String {
        self.config_snapshot().main_key
    }

    fn config_snapshot(&self) -> SessionSchedulerConfig {
        self.inner
            .config
            .lock()
            .map(|config| config.clone())
            .expect("scheduler config lock poisoned")
    }

    /// Runs a closure against the session store.
    pub fn with_store<T>(&self, apply: impl FnOnce(&mut SessionStore) -> T) -> T {
        let mut store = self
            .inner
            .store
            .lock()
            .expect("session store lock poisoned");
        apply(&mut store)
    }

    pub async fn active_run(&self, session_key: &str) -> Option<ActiveRunInfo> {
        self.inner.registry.active_run(session_key).await
    }

    pub async fn active_runs(&self) -> Vec<ActiveRunInfo> {
        self.inner.registry.active_runs().await
    }

    /// True when the key has an active run or parked envelopes.
    pub async fn is_busy(&self, session_key: &str) -> bool {
        if self.inner.registry.has_active_run(session_key).await {
            return true;
        }
        let pending = self.inner.pending.lock().await;
        pending
            .get(session_key)
            .map(|queue| !queue.is_empty())
            .unwrap_or(false)
    }

    /// Idempotent abort by run id.
    pub async fn abort(&self, run_id: &str) -> bool {
        self.inner.registry.abort(run_id).await
    }

    pub async fn abort_session(&self, session_key: &str) -> bool {
        self.inner.registry.abort_session(session_key).await
    }

    /// Full inbound path: directives → session key → entry → queue machine.
    ///
    /// The caller has already gated the envelope through channel policy.
    pub async fn handle_inbound(&self, envelope: ChannelEnvelope) -> Result<String> {
        envelope.validate()?;
        let config = self.config_snapshot();
        let session_key = resolve_session_key(&envelope, config.scope, &config.main_key);

        let parsed = parse_directives(&envelope.body);
        let mut envelope = envelope;
        envelope.command_body = parsed.command_body.clone();

        let mut reset_requested = false;
        let mut patch = SessionPatch::default();
        for directive in &parsed.directives {
            match directive {
                Directive::New | Directive::Reset => reset_requested = true,
                Directive::Thinking { level } => patch.thinking_level = Some(level.clone()),
                Directive::Verbose { level } => patch.verbose_level = Some(level.clone()),
                Directive::Activation { mode } => patch.group_activation = Some(mode.clone()),
                Directive::Unknown { name } => {
                    debug!(target: "clawdis.scheduler", directive = %name, "ignoring unknown directive");
                }
            }
        }

        let backlog_flag;
        {
            let mut store = self
                .inner
                .store
                .lock()
                .expect("session store lock poisoned");
            if reset_requested {
                store.reset(&session_key)?;
            }
            let entry = store.ensure_entry(&session_key)?;
            backlog_flag = entry.aborted_last_run == Some(true);
            if patch.thinking_level.is_some()
                || patch.verbose_level.is_some()
                || patch.group_activation.is_some()
            {
                store.patch(&session_key, patch)?;
            }
        }

        if envelope.command_body.trim().is_empty() && envelope.media.is_none() {
            // Pure directive message: state is updated, nothing to run.
            return Ok(session_key);
        }

        let mode = config.queue_mode_for(envelope.surface.as_str());
        let queued = QueuedEnvelope {
            envelope,
            mode,
            enqueued_at_ms: unix_time_ms(),
            backlog: backlog_flag && mode.is_backlog(),
        };
        self.dispatch(&session_key, queued).await?;
        Ok(session_key)
    }

    /// Starts a synthesized run (heartbeat, cron) and awaits its terminal
    /// state. Fails fast when the key is busy.
    pub async fn run_detached(
        &self,
        session_key: &str,
        prompt: &str,
        deliver: bool,
    ) -> Result<(RunState, Vec<RunPayload>)> {
        if self.is_busy(session_key).await {
            anyhow::bail!("session '{}' has requests in flight", session_key);
        }
        self.with_store(|store| store.ensure_entry(session_key))?;

        let mut envelope = ChannelEnvelope::new(
            clawdis_channel::ChannelSurface::Webchat,
            "system",
            prompt.to_string(),
        );
        envelope.command_body = prompt.to_string();
        let queued = QueuedEnvelope {
            envelope,
            mode: QueueMode::Followup,
            enqueued_at_ms: unix_time_ms(),
            backlog: false,
        };

        let mut events = self.subscribe();
        let info = self
            .start_run(session_key, vec![queued], !deliver)
            .await?;
        let state = wait_for_terminal(info.state_rx.clone()).await;
        // The finish event always follows the terminal state transition.
        let mut payloads = Vec::new();
        while let Ok(event) = events.recv().await {
            if let SchedulerEvent::RunFinished {
                run_id, payloads: finished, ..
            } = event
            {
                if run_id == info.run_id {
                    payloads = finished;
                    break;
                }
            }
        }
        Ok((state, payloads))
    }

    async fn dispatch(&self, session_key: &str, queued: QueuedEnvelope) -> Result<()> {
        let active = self.inner.registry.active_run(session_key).await;
        let Some(active) = active else {
            self.start_run(session_key, vec![queued], false).await?;
            return Ok(());
        };

        match queued.mode.base_mode() {
            QueueMode::Interrupt => {
                debug!(
                    target: "clawdis.scheduler",
                    session_key,
                    run_id = %active.run_id,
                    "interrupting active run"
                );
                self.park(session_key, queued).await;
                self.inner.registry.abort(&active.run_id).await;
            }
            QueueMode::Steer => {
                let turn = queued.envelope.command_body.clone();
                if active.steer_tx.send(turn).is_err() {
                    // Engine already tore down its steer receiver; fall back
                    // to parking so the message is not lost.
                    self.park(session_key, queued).await;
                }
            }
            QueueMode::Followup | QueueMode::Collect => {
                self.park(session_key, queued).await;
            }
            // base_mode never returns a backlog variant.
            _ => unreachable!("base queue mode"),
        }
        Ok(())
    }

    async fn park(&self, session_key: &str, queued: QueuedEnvelope) {
        let mut pending = self.inner.pending.lock().await;
        pending
            .entry(session_key.to_string())
            .or_default()
            .push_back(queued);
    }

    fn start_run<'a>(
        &'a self,
        session_key: &'a str,
        inputs: Vec<QueuedEnvelope>,
        suppress_delivery: bool,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<ActiveRunInfo>> + Send + 'a>>
    {
        Box::pin(async move {
        let (prompt, origin) = compose_prompt(&inputs);
        let idempotency_key = inputs
            .first()
            .and_then(|queued| queued.envelope.message_id.clone())
            .unwrap_or_else(|| format!("synthesized-{}", unix_time_ms()));

        let (info, steer_rx) = self
            .inner
            .registry
            .begin(session_key, &idempotency_key)
            .await?;

        let thinking_level = self.with_store(|store| {
            store
                .entry(session_key)
                .and_then(|entry| entry.thinking_level.clone())
        });
        self.record_inbound_transcripts(session_key, &inputs, &info.run_id);

        let _ = self.inner.events_tx.send(SchedulerEvent::RunStarted {
            run_id: info.run_id.clone(),
            session_key: session_key.to_string(),
        });

        let scheduler = self.clone();
        let run_info = info.clone();
        let request = AgentRunRequest {
            session_key: session_key.to_string(),
            prompt,
            thinking_level,
            steer: steer_rx,
        };
        tokio::spawn(async move {
            scheduler
                .drive_run(run_info, request, origin, suppress_delivery)
                .await;
        });
        Ok(info)
        })
    }

    async fn drive_run(
        &self,
        info: ActiveRunInfo,
        request: AgentRunRequest,
        origin: Option<ChannelEnvelope>,
        suppress_delivery: bool,
    ) {
        let session_key = info.session_key.clone();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();

        self.inner
            .registry
            .set_state(&session_key, &info.run_id, RunState::Streaming)
            .await;

        let engine = Arc::clone(&self.inner.engine);
        let cancel = info.cancel.clone();
        let mut engine_task =
            tokio::spawn(async move { engine.run(request, event_tx, cancel).await });

        // Forward stream events until the engine returns; engine order is
        // preserved and the terminal event always comes after these.
        let outcome = loop {
            tokio::select! {
                event = event_rx.recv() => {
                    match event {
                        Some(event) => {
                            let _ = self.inner.events_tx.send(SchedulerEvent::Agent {
                                run_id: info.run_id.clone(),
                                session_key: session_key.clone(),
                                event,
                            });
                        }
                        None => {
                            self.inner
                                .registry
                                .set_state(&session_key, &info.run_id, RunState::AwaitingFinal)
                                .await;
                            break match (&mut engine_task).await {
                                Ok(Ok(outcome)) => outcome,
                                Ok(Err(error)) => RunOutcome::Error {
                                    message: format!("{error:#}"),
                                },
                                Err(join_error) => RunOutcome::Error {
                                    message: format!("engine task failed: {join_error}"),
                                },
                            };
                        }
                    }
                }
                joined = &mut engine_task => {
                    // Drain whatever the engine managed to emit first.
                    while let Ok(event) = event_rx.try_recv() {
                        let _ = self.inner.events_tx.send(SchedulerEvent::Agent {
                            run_id: info.run_id.clone(),
                            session_key: session_key.clone(),
                            event,
                        });
                    }
                    break match joined {
                        Ok(Ok(outcome)) => outcome,
                        Ok(Err(error)) => RunOutcome::Error {
                            message: format!("{error:#}"),
                        },
                        Err(join_error) => RunOutcome::Error {
                            message: format!("engine task failed: {join_error}"),
                        },
                    };
                }
            }
        };

        let outcome = if info.cancel.is_cancelled() {
            RunOutcome::Aborted
        } else {
            outcome
        };

        let (state, payloads, error, meta) = match outcome {
            RunOutcome::Final { payloads, meta } => (RunState::Final, payloads, None, meta),
            RunOutcome::Aborted => (RunState::Aborted, Vec::new(), None, RunMeta::default()),
            RunOutcome::ContextOverflow => (
                RunState::Final,
                vec![RunPayload::text(CONTEXT_OVERFLOW_FALLBACK_REPLY)],
                None,
                RunMeta::default(),
            ),
            RunOutcome::Error { message } => {
                (RunState::Error, Vec::new(), Some(message), RunMeta::default())
            }
        };

        // Store first, then fan out: clients observing `final` may re-read
        // the session safely.
        // Synthesized webchat runs must not steal the session's last route.
        let routable_origin = origin
            .as_ref()
            .filter(|env| env.surface != clawdis_channel::ChannelSurface::Webchat);
        let store_result = self.with_store(|store| {
            store.record_run_result(
                &session_key,
                SessionUsageDelta {
                    channel: routable_origin.map(|env| env.surface.as_str().to_string()),
                    to: routable_origin.map(|env| env.from.clone()),
                    input_tokens: meta.input_tokens,
                    output_tokens: meta.output_tokens,
                    model: meta.model.clone(),
                    context_tokens: meta.context_tokens,
                    aborted: state == RunState::Aborted,
                },
            )
        });
        if let Err(error) = store_result {
            warn!(
                target: "clawdis.scheduler",
                session_key,
                error = %error,
                "failed to persist run result"
            );
        }
        self.record_outbound_transcripts(&session_key, &payloads, &info.run_id);

        if state == RunState::Final && !suppress_delivery && !payloads.is_empty() {
            self.inner
                .sink
                .deliver(&session_key, origin.as_ref(), &payloads, &info.delivery_abort)
                .await;
        }

        self.inner
            .registry
            .finish(&session_key, &info.run_id, state)
            .await;
        let _ = self.inner.events_tx.send(SchedulerEvent::RunFinished {
            run_id: info.run_id.clone(),
            session_key: session_key.clone(),
            state,
            payloads,
            error,
        });

        if let Err(error) = self.drain_pending(&session_key).await {
            warn!(
                target: "clawdis.scheduler",
                session_key,
                error = %error,
                "failed to drain pending queue"
            );
        }
    }

    async fn drain_pending(&self, session_key: &str) -> Result<()> {
        let drained = {
            let mut pending = self.inner.pending.lock().await;
            match pending.remove(session_key) {
                Some(queue) if !queue.is_empty() => queue,
                _ => return Ok(()),
            }
        };

        // Backlog replay: disconnected-arrival envelopes run first.
        let mut items: Vec<QueuedEnvelope> = drained.into();
        items.sort_by_key(|item| !item.backlog);

        self.start_run(session_key, items, false)
            .await
            .context("failed to start drained run")?;
        Ok(())
    }

    fn record_inbound_transcripts(
        &self,
        session_key: &str,
        inputs: &[QueuedEnvelope],
        run_id: &str,
    ) {
        let Some(dir) = self.config_snapshot().transcript_dir else {
            return;
        };
        let session_id = self.with_store(|store| {
            store
                .entry(session_key)
                .map(|entry| entry.session_id.clone())
        });
        let Some(session_id) = session_id else {
            return;
        };
        let path = dir.join(format!("{session_id}.jsonl"));
        for input in inputs {
            let record = TranscriptRecord {
                timestamp_unix_ms: input.enqueued_at_ms,
                role: "user".to_string(),
                text: input.envelope.body.clone(),
                run_id: Some(run_id.to_string()),
                channel: Some(input.envelope.surface.as_str().to_string()),
            };
            if let Err(error) = append_transcript(&path, &record) {
                warn!(target: "clawdis.scheduler", error = %error, "failed to append transcript");
            }
        }
    }

    fn record_outbound_transcripts(&self, session_key: &str, payloads: &[RunPayload], run_id: &str) {
        let Some(dir) = self.config_snapshot().transcript_dir else {
            return;
        };
        let session_id = self.with_store(|store| {
            store
                .entry(session_key)
                .map(|entry| entry.session_id.clone())
        });
        let Some(session_id) = session_id else {
            return;
        };
        let path = dir.join(format!("{session_id}.jsonl"));
        for payload in payloads {
            if payload.is_empty() {
                continue;
            }
            let record = TranscriptRecord {
                timestamp_unix_ms: unix_time_ms(),
                role: "assistant".to_string(),
                text: payload.text.clone(),
                run_id: Some(run_id.to_string()),
                channel: None,
            };
            if let Err(error) = append_transcript(&path, &record) {
                warn!(target: "clawdis.scheduler", error = %error, "failed to append transcript");
            }
        }
    }
}

/// Composes the run prompt from drained inputs.
///
/// Followup concatenates; collect wraps prior messages in an explicit
/// history section and applies directive stripping only to the current
/// message.
fn compose_prompt(inputs: &[QueuedEnvelope]) -> (String, Option<ChannelEnvelope>) {
    let origin = inputs.last().map(|queued| queued.envelope.clone());
    if inputs.is_empty() {
        return (String::new(), None);
    }
    if inputs.len() == 1 {
        return (inputs[0].envelope.command_body.clone(), origin);
    }

    let collect = inputs
        .last()
        .map(|queued| queued.mode.base_mode() == QueueMode::Collect)
        .unwrap_or(false);
    if collect {
        let (history, current) = inputs.split_at(inputs.len() - 1);
        let history_text = history
            .iter()
            .map(|queued| queued.envelope.body.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "{COLLECT_HISTORY_HEADER}\n{history_text}\n\n{COLLECT_CURRENT_HEADER}\n{}",
            current[0].envelope.command_body
        );
        (prompt, origin)
    } else {
        let prompt = inputs
            .iter()
            .map(|queued| queued.envelope.command_body.as_str())
            .filter(|text| !text.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n\n");
        (prompt, origin)
    }
}
