//! Namespaced RPC dispatch.
//!
//! Every method validates its params with field-path errors, runs against
//! the shared runtime handles, and returns a JSON result. Timeouts are
//! enforced by the connection layer using `rpc_timeout_ms`.

use std::collections::HashMap;
use std::sync::Arc;

use clawdis_channel::{ChannelAdapter, ChannelSurface, PairingStore};
use clawdis_config::{
    changed_config_prefixes, load_config, parse_config, save_config, StateDir,
};
use clawdis_core::{generate_pairing_code, unix_time_ms, unix_time_secs};
use clawdis_runtime::{
    run_registry::wait_for_terminal, CronPayload, CronStore, HeartbeatRunner, RunState,
    SchedulerEvent, SessionScheduler, SessionSchedulerConfig,
};
use clawdis_session::{read_transcript, SessionPatch};
use serde_json::{json, Map, Value};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::gateway_protocol::{GatewayError, DEFAULT_RPC_TIMEOUT_MS, PROTOCOL_VERSION};

const WEB_LOGIN_TTL_SECONDS: u64 = 600;

/// Per-method timeout; the default is ten seconds.
pub fn rpc_timeout_ms(method: &str, expect_final: bool) -> u64 {
    match method {
        "chat.send" if expect_final => 120_000,
        "web.login.wait" => 60_000,
        "cron.run" => 120_000,
        _ => DEFAULT_RPC_TIMEOUT_MS,
    }
}

#[derive(Debug, Clone)]
struct WebLoginCode {
    created_at_unix: u64,
    expires_at_unix: u64,
    approved: bool,
}

/// Shared handles the dispatcher operates on.
pub struct GatewayRpcDeps {
    pub scheduler: SessionScheduler,
    pub channels: Arc<clawdis_channel::ChannelRegistry>,
    pub heartbeat: Arc<HeartbeatRunner>,
    pub cron: Arc<AsyncMutex<CronStore>>,
    pub state_dir: StateDir,
    pub started_at_ms: u64,
}

/// Public struct `GatewayRpc` used across Clawdis components.
pub struct GatewayRpc {
    deps: GatewayRpcDeps,
    login_codes: std::sync::Mutex<HashMap<String, WebLoginCode>>,
}

impl GatewayRpc {
    pub fn new(deps: GatewayRpcDeps) -> Self {
        Self {
            deps,
            login_codes: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn scheduler(&self) -> &SessionScheduler {
        &self.deps.scheduler
    }

    /// Presence + health snapshot included in `helloOk`.
    pub async fn snapshot(&self, presence: Value) -> Value {
        json!({
            "presence": presence,
            "health": self.health_payload().await,
        })
    }

    async fn health_payload(&self) -> Value {
        let active_runs = self.deps.scheduler.active_runs().await.len();
        json!({
            "status": "ok",
            "protocol": PROTOCOL_VERSION,
            "uptimeMs": unix_time_ms().saturating_sub(self.deps.started_at_ms),
            "activeRuns": active_runs,
        })
    }

    pub async fn dispatch(
        &self,
        method: &str,
        params: Option<Value>,
        expect_final: bool,
    ) -> Result<Value, GatewayError> {
        let params = match params {
            Some(Value::Object(map)) => map,
            Some(Value::Null) | None => Map::new(),
            Some(_) => {
                return Err(GatewayError::invalid_input(
                    "params",
                    "params must be an object",
                ))
            }
        };

        match method {
            "health" => Ok(self.health_payload().await),
            "chat.history" => self.chat_history(&params),
            "chat.send" => self.chat_send(&params, expect_final).await,
            "chat.abort" => self.chat_abort(&params).await,
            "sessions.list" => self.sessions_list(),
            "sessions.patch" => self.sessions_patch(&params),
            "nodes.list" => self.nodes_list(),
            "providers.status" => self.providers_status(),
            "channels.status" => self.channels_status().await,
            "channels.logout" => self.channels_logout(&params).await,
            "config.get" => self.config_get(),
            "config.put" => self.config_put(&params).await,
            "cron.list" => self.cron_list().await,
            "cron.status" => self.cron_status().await,
            "cron.run" => self.cron_run(&params).await,
            "skills.list" => self.skills_list(),
            "web.login.start" => self.web_login_start(),
            "web.login.wait" => self.web_login_wait(&params).await,
            "web.login.approve" => self.web_login_approve(&params),
            "pairing.list" => self.pairing_list(&params),
            "pairing.approve" => self.pairing_approve(&params),
            other => Err(GatewayError::invalid_input(
                "method",
                format!("unknown method '{other}'"),
            )),
        }
    }

    fn chat_history(&self, params: &Map<String, Value>) -> Result<Value, GatewayError> {
        let session_key = opt_str(params, "sessionKey")?.unwrap_or_else(|| "main".to_string());
        let limit = params
            .get("limit")
            .and_then(Value::as_u64)
            .unwrap_or(50) as usize;

        let session_id = self
            .deps
            .scheduler
            .with_store(|store| store.entry(&session_key).map(|entry| entry.session_id.clone()));
        let Some(session_id) = session_id else {
            return Ok(json!({ "sessionKey": session_key, "messages": [] }));
        };
        let path = self.deps.state_dir.transcript_path(&session_id);
        let records = read_transcript(&path, limit)
            .map_err(|error| GatewayError::Internal(format!("{error:#}")))?;
        Ok(json!({
            "sessionKey": session_key,
            "sessionId": session_id,
            "messages": records,
        }))
    }

    async fn chat_send(
        &self,
        params: &Map<String, Value>,
        expect_final: bool,
    ) -> Result<Value, GatewayError> {
        let message = require_str(params, "message")?;
        let mut envelope = clawdis_channel::ChannelEnvelope::new(
            ChannelSurface::Webchat,
            "owner",
            message.clone(),
        );
        envelope.timestamp_ms = unix_time_ms();
        envelope.message_id = opt_str(params, "idempotencyKey")?;

        let mut events = self.deps.scheduler.subscribe();
        let busy_before = self
            .deps
            .scheduler
            .is_busy(&self.deps.scheduler.main_key())
            .await;
        let session_key = self
            .deps
            .scheduler
            .handle_inbound(envelope)
            .await
            .map_err(|error| GatewayError::Internal(format!("{error:#}")))?;

        if busy_before {
            // Parked or steered behind the in-flight run.
            return Ok(json!({ "sessionKey": session_key, "queued": true }));
        }
        let Some(run) = self.deps.scheduler.active_run(&session_key).await else {
            // Pure directive message; state changed, nothing ran.
            return Ok(json!({ "sessionKey": session_key, "queued": false }));
        };

        if !expect_final {
            return Ok(json!({
                "sessionKey": session_key,
                "runId": run.run_id,
            }));
        }

        let state = wait_for_terminal(run.state_rx.clone()).await;
        let mut payloads = Vec::new();
        let mut error = None;
        while let Ok(event) = events.recv().await {
            if let SchedulerEvent::RunFinished {
                run_id,
                payloads: finished,
                error: finished_error,
                ..
            } = event
            {
                if run_id == run.run_id {
                    payloads = finished;
                    error = finished_error;
                    break;
                }
            }
        }
        Ok(json!({
            "sessionKey": session_key,
            "runId": run.run_id,
            "state": state.as_str(),
            "payloads": payloads,
            "error": error,
        }))
    }

    async fn chat_abort(&self, params: &Map<String, Value>) -> Result<Value, GatewayError> {
        let aborted = if let Some(run_id) = opt_str(params, "runId")? {
            self.deps.scheduler.abort(&run_id).await
        } else if let Some(session_key) = opt_str(params, "sessionKey")? {
            self.deps.scheduler.abort_session(&session_key).await
        } else {
            return Err(GatewayError::invalid_input(
                "params",
                "chat.abort needs runId or sessionKey",
            ));
        };
        // Idempotent: a second abort of the same run reports ok with no-op.
        Ok(json!({ "ok": true, "aborted": aborted }))
    }

    fn sessions_list(&self) -> Result<Value, GatewayError> {
        let rows = self.deps.scheduler.with_store(|store| store.list());
        let sessions = rows
            .into_iter()
            .map(|(key, entry)| json!({ "key": key, "entry": entry }))
            .collect::<Vec<_>>();
        Ok(json!({ "sessions": sessions }))
    }

    fn sessions_patch(&self, params: &Map<String, Value>) -> Result<Value, GatewayError> {
        let session_key = require_str(params, "sessionKey")?;
        let patch = SessionPatch {
            thinking_level: opt_str(params, "thinkingLevel")?,
            verbose_level: opt_str(params, "verboseLevel")?,
            group_activation: opt_str(params, "groupActivation")?,
            system_sent: params.get("systemSent").and_then(Value::as_bool),
        };
        let entry = self
            .deps
            .scheduler
            .with_store(|store| store.patch(&session_key, patch))
            .map_err(|error| GatewayError::Internal(format!("{error:#}")))?;
        Ok(json!({ "key": session_key, "entry": entry }))
    }

    fn nodes_list(&self) -> Result<Value, GatewayError> {
        let read_nodes = |path: std::path::PathBuf| -> Value {
            std::fs::read_to_string(&path)
                .ok()
                .and_then(|raw| serde_json::from_str::<Value>(&raw).ok())
                .unwrap_or_else(|| json!([]))
        };
        Ok(json!({
            "pending": read_nodes(self.deps.state_dir.nodes_pending_path()),
            "paired": read_nodes(self.deps.state_dir.nodes_paired_path()),
        }))
    }

    fn providers_status(&self) -> Result<Value, GatewayError> {
        let config = load_config(&self.deps.state_dir.config_path())
            .map_err(|error| GatewayError::Internal(format!("{error:#}")))?;
        Ok(json!({
            "model": config.agent.model,
            "heartbeat": {
                "every": config.agent.heartbeat.every,
                "target": config.agent.heartbeat.target.as_str(),
            },
        }))
    }

    async fn channels_status(&self) -> Result<Value, GatewayError> {
        let config = load_config(&self.deps.state_dir.config_path())
            .map_err(|error| GatewayError::Internal(format!("{error:#}")))?;
        let accounts = self.deps.channels.status_snapshot().await;
        let channels = self
            .deps
            .channels
            .docks()
            .into_iter()
            .map(|dock| {
                let section = config.channel(dock.id.as_str());
                let configured = self
                    .deps
                    .channels
                    .adapter(dock.id)
                    .map(|adapter| adapter.is_configured(&section))
                    .unwrap_or(false);
                json!({
                    "id": dock.id.as_str(),
                    "label": dock.label,
                    "enabled": section.enabled,
                    "configured": configured,
                    "dmPolicy": section.dm_policy.as_str(),
                    "groupPolicy": section.group_policy.as_str(),
                })
            })
            .collect::<Vec<_>>();
        Ok(json!({ "channels": channels, "accounts": accounts }))
    }

    async fn channels_logout(&self, params: &Map<String, Value>) -> Result<Value, GatewayError> {
        let channel = require_str(params, "channel")?;
        let surface = ChannelSurface::parse(&channel).ok_or_else(|| {
            GatewayError::invalid_input("params.channel", format!("unknown channel '{channel}'"))
        })?;
        self.deps
            .channels
            .stop_account(surface, "default")
            .await
            .map_err(|error| GatewayError::Internal(format!("{error:#}")))?;

        let mut removed = Vec::new();
        let credentials_dir = self.deps.state_dir.credentials_dir();
        if let Ok(entries) = std::fs::read_dir(&credentials_dir) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                if name.starts_with(&format!("{channel}-")) {
                    if std::fs::remove_file(entry.path()).is_ok() {
                        removed.push(name);
                    }
                }
            }
        }
        info!(target: "clawdis.gateway", channel = %channel, removed = removed.len(), "channel logged out");
        Ok(json!({ "ok": true, "removedCredentials": removed }))
    }

    fn config_get(&self) -> Result<Value, GatewayError> {
        let config = load_config(&self.deps.state_dir.config_path())
            .map_err(|error| GatewayError::Internal(format!("{error:#}")))?;
        serde_json::to_value(&config).map_err(|error| GatewayError::Internal(error.to_string()))
    }

    async fn config_put(&self, params: &Map<String, Value>) -> Result<Value, GatewayError> {
        let new_value = params
            .get("config")
            .cloned()
            .ok_or_else(|| GatewayError::invalid_input("params.config", "missing config body"))?;
        let rendered = serde_json::to_string(&new_value)
            .map_err(|error| GatewayError::Internal(error.to_string()))?;
        let parsed = parse_config(&rendered)
            .map_err(|error| GatewayError::invalid_input("params.config", format!("{error:#}")))?;

        let config_path = self.deps.state_dir.config_path();
        let old_value = load_config(&config_path)
            .ok()
            .and_then(|config| serde_json::to_value(&config).ok())
            .unwrap_or_else(|| json!({}));
        save_config(&config_path, &parsed)
            .map_err(|error| GatewayError::Internal(format!("{error:#}")))?;

        // Push the new config into the runtimes, then hot-restart only the
        // adapters whose subtree changed.
        self.deps.scheduler.update_config(SessionSchedulerConfig::from_config(
            &parsed,
            Some(self.deps.state_dir.sessions_dir()),
        ));
        self.deps.heartbeat.update_config(parsed.clone());

        let prefixes = self.deps.channels.config_prefixes();
        let new_rendered = serde_json::to_value(&parsed)
            .map_err(|error| GatewayError::Internal(error.to_string()))?;
        let changed = changed_config_prefixes(&old_value, &new_rendered, &prefixes)
            .into_iter()
            .map(str::to_string)
            .collect::<Vec<_>>();
        for prefix in &changed {
            let Some(channel_id) = prefix.strip_prefix("channels.") else {
                continue;
            };
            let Some(surface) = ChannelSurface::parse(channel_id) else {
                continue;
            };
            if self
                .deps
                .channels
                .account_status(surface, "default")
                .await
                .is_some()
            {
                if let Err(error) = self.deps.channels.reload_account(surface, "default").await {
                    warn!(
                        target: "clawdis.gateway",
                        channel = channel_id,
                        error = %error,
                        "hot reload failed"
                    );
                }
            }
        }
        Ok(json!({ "ok": true, "changedPrefixes": changed }))
    }

    async fn cron_list(&self) -> Result<Value, GatewayError> {
        let cron = self.deps.cron.lock().await;
        Ok(json!({ "jobs": cron.jobs() }))
    }

    async fn cron_status(&self) -> Result<Value, GatewayError> {
        let cron = self.deps.cron.lock().await;
        let log = cron
            .read_run_log(20)
            .map_err(|error| GatewayError::Internal(format!("{error:#}")))?;
        Ok(json!({ "jobs": cron.jobs(), "recentRuns": log }))
    }

    async fn cron_run(&self, params: &Map<String, Value>) -> Result<Value, GatewayError> {
        let job_id = require_str(params, "jobId")?;
        let job = {
            let cron = self.deps.cron.lock().await;
            cron.job(&job_id).cloned()
        };
        let Some(job) = job else {
            return Err(GatewayError::invalid_input(
                "params.jobId",
                format!("unknown cron job '{job_id}'"),
            ));
        };

        let prompt = match &job.payload {
            CronPayload::SystemPrompt { text } => {
                format!("[Scheduled task: {}]\n{}", job.name, text)
            }
            CronPayload::UserMessage { text } => text.clone(),
        };
        let started = unix_time_ms();
        let main_key = self.deps.scheduler.main_key();
        let result = self
            .deps
            .scheduler
            .run_detached(&main_key, &prompt, true)
            .await;
        let (status, detail) = match &result {
            Ok((RunState::Final, _)) => ("ok".to_string(), None),
            Ok((state, _)) => (state.as_str().to_string(), None),
            Err(error) => ("error".to_string(), Some(format!("{error:#}"))),
        };

        {
            let mut cron = self.deps.cron.lock().await;
            let record = clawdis_runtime::CronRunRecord {
                job_id: job.id.clone(),
                scheduled_unix_ms: started,
                started_unix_ms: started,
                duration_ms: unix_time_ms().saturating_sub(started),
                status: status.clone(),
                detail: detail.clone(),
            };
            if let Err(error) = cron.append_run_record(&record) {
                warn!(target: "clawdis.gateway", error = %error, "failed to log cron run");
            }
            cron.mark_ran(&job.id, started)
                .map_err(|error| GatewayError::Internal(format!("{error:#}")))?;
        }
        Ok(json!({ "jobId": job.id, "status": status, "detail": detail }))
    }

    fn skills_list(&self) -> Result<Value, GatewayError> {
        let config = load_config(&self.deps.state_dir.config_path())
            .map_err(|error| GatewayError::Internal(format!("{error:#}")))?;
        let skills = config
            .extra
            .get("skills")
            .cloned()
            .unwrap_or_else(|| json!([]));
        Ok(json!({ "skills": skills }))
    }

    fn web_login_start(&self) -> Result<Value, GatewayError> {
        let code = generate_pairing_code();
        let now = unix_time_secs();
        let entry = WebLoginCode {
            created_at_unix: now,
            expires_at_unix: now + WEB_LOGIN_TTL_SECONDS,
            approved: false,
        };
        self.login_codes
            .lock()
            .expect("login codes lock poisoned")
            .insert(code.clone(), entry);
        Ok(json!({
            "code": code,
            "expiresAtUnix": now + WEB_LOGIN_TTL_SECONDS,
        }))
    }

    async fn web_login_wait(&self, params: &Map<String, Value>) -> Result<Value, GatewayError> {
        let code = require_str(params, "code")?.to_ascii_uppercase();
        for _ in 0..120 {
            let status = {
                let codes = self.login_codes.lock().expect("login codes lock poisoned");
                codes.get(&code).cloned()
            };
            let Some(status) = status else {
                return Err(GatewayError::invalid_input(
                    "params.code",
                    "unknown or expired login code",
                ));
            };
            if status.expires_at_unix <= unix_time_secs() {
                self.login_codes
                    .lock()
                    .expect("login codes lock poisoned")
                    .remove(&code);
                return Err(GatewayError::invalid_input(
                    "params.code",
                    "unknown or expired login code",
                ));
            }
            if status.approved {
                return Ok(json!({ "approved": true, "createdAtUnix": status.created_at_unix }));
            }
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        }
        Ok(json!({ "approved": false, "pending": true }))
    }

    fn web_login_approve(&self, params: &Map<String, Value>) -> Result<Value, GatewayError> {
        let code = require_str(params, "code")?.to_ascii_uppercase();
        let mut codes = self.login_codes.lock().expect("login codes lock poisoned");
        match codes.get_mut(&code) {
            Some(entry) if entry.expires_at_unix > unix_time_secs() => {
                entry.approved = true;
                Ok(json!({ "ok": true }))
            }
            _ => Err(GatewayError::invalid_input(
                "params.code",
                "unknown or expired login code",
            )),
        }
    }

    fn pairing_list(&self, params: &Map<String, Value>) -> Result<Value, GatewayError> {
        let channel = require_str(params, "channel")?;
        let store = self.open_pairing_store(&channel)?;
        let now = unix_time_secs();
        let requests = store
            .list(now)
            .into_iter()
            .cloned()
            .collect::<Vec<_>>();
        Ok(json!({ "channel": channel, "requests": requests }))
    }

    fn pairing_approve(&self, params: &Map<String, Value>) -> Result<Value, GatewayError> {
        let channel = require_str(params, "channel")?;
        let code = require_str(params, "code")?;
        let mut store = self.open_pairing_store(&channel)?;
        let peer = store
            .approve(&code, unix_time_secs())
            .map_err(|error| GatewayError::invalid_input("params.code", format!("{error:#}")))?;

        // Approval admits the peer: it joins the channel allowlist.
        let config_path = self.deps.state_dir.config_path();
        let mut config = load_config(&config_path)
            .map_err(|error| GatewayError::Internal(format!("{error:#}")))?;
        let section = config.channels.entry(channel.clone()).or_default();
        if !section.allow_from.iter().any(|entry| entry == &peer) {
            section.allow_from.push(peer.clone());
        }
        save_config(&config_path, &config)
            .map_err(|error| GatewayError::Internal(format!("{error:#}")))?;
        info!(target: "clawdis.gateway", channel = %channel, peer = %peer, "pairing approved");
        Ok(json!({ "ok": true, "channel": channel, "peer": peer }))
    }

    fn open_pairing_store(&self, channel: &str) -> Result<PairingStore, GatewayError> {
        if ChannelSurface::parse(channel).is_none() {
            return Err(GatewayError::invalid_input(
                "params.channel",
                format!("unknown channel '{channel}'"),
            ));
        }
        PairingStore::open(
            self.deps.state_dir.channel_credentials_path(channel, "pairing"),
            channel,
        )
        .map_err(|error| GatewayError::Internal(format!("{error:#}")))
    }
}

fn require_str(params: &Map<String, Value>, key: &str) -> Result<String, GatewayError> {
    opt_str(params, key)?.ok_or_else(|| {
        GatewayError::invalid_input(&format!("params.{key}"), "missing required field")
    })
}

fn opt_str(params: &Map<String, Value>, key: &str) -> Result<Option<String>, GatewayError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) if !value.trim().is_empty() => {
            Ok(Some(value.trim().to_string()))
        }
        Some(Value::String(_)) => Err(GatewayError::invalid_input(
            &format!("params.{key}"),
            "must be non-empty when provided",
        )),
        Some(_) => Err(GatewayError::invalid_input(
            &format!("params.{key}"),
            "must be a string",
        )),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use clawdis_channel::ChannelRegistry;
    use clawdis_config::{save_config, ClawdisConfig, StateDir};
    use clawdis_runtime::{
        AgentEngine, AgentRunRequest, AgentStreamEvent, CancellationFlag, CronStore,
        HeartbeatRunner, NullOutputSink, RunMeta, RunOutcome, RunPayload, SessionScheduler,
        SessionSchedulerConfig,
    };
    use clawdis_session::SessionStore;
    use serde_json::{json, Value};
    use tokio::sync::{mpsc, Mutex as AsyncMutex};

    use super::{rpc_timeout_ms, GatewayRpc, GatewayRpcDeps};

    struct EchoEngine;

    #[async_trait]
    impl AgentEngine for EchoEngine {
        async fn run(
            &self,
            request: AgentRunRequest,
            events: mpsc::UnboundedSender<AgentStreamEvent>,
            _cancel: CancellationFlag,
        ) -> anyhow::Result<RunOutcome> {
            let reply = format!("echo: {}", request.prompt);
            let _ = events.send(AgentStreamEvent::AssistantMessage {
                text: reply.clone(),
            });
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(RunOutcome::Final {
                payloads: vec![RunPayload::text(reply)],
                meta: RunMeta::default(),
            })
        }
    }

    fn rpc(dir: &std::path::Path) -> GatewayRpc {
        let state_dir = StateDir::new(dir);
        let config = ClawdisConfig::default();
        save_config(&state_dir.config_path(), &config).expect("save config");

        let store = SessionStore::load(state_dir.session_store_path()).expect("store");
        let scheduler = SessionScheduler::new(
            Arc::new(EchoEngine),
            store,
            Arc::new(NullOutputSink),
            SessionSchedulerConfig::from_config(&config, Some(state_dir.sessions_dir())),
        );
        let (channels, _webchat_rx) = ChannelRegistry::builtin();
        let channels = Arc::new(channels);
        let heartbeat = Arc::new(HeartbeatRunner::new(
            scheduler.clone(),
            Arc::clone(&channels),
            config,
        ));
        let cron = CronStore::open(
            state_dir.cron_jobs_path(),
            state_dir.cron_run_log_path(),
        )
        .expect("cron store");

        GatewayRpc::new(GatewayRpcDeps {
            scheduler,
            channels,
            heartbeat,
            cron: Arc::new(AsyncMutex::new(cron)),
            state_dir,
            started_at_ms: clawdis_core::unix_time_ms(),
        })
    }

    #[tokio::test]
    async fn functional_chat_send_expect_final_returns_payloads() {
        let temp = tempfile::tempdir().expect("tempdir");
        let rpc = rpc(temp.path());
        let result = rpc
            .dispatch(
                "chat.send",
                Some(json!({ "message": "hello there" })),
                true,
            )
            .await
            .expect("dispatch");
        assert_eq!(result["state"], json!("final"));
        assert_eq!(result["payloads"][0]["text"], json!("echo: hello there"));
        assert_eq!(result["sessionKey"], json!("main"));
    }

    #[tokio::test]
    async fn functional_chat_abort_is_idempotent_over_rpc() {
        let temp = tempfile::tempdir().expect("tempdir");
        let rpc = rpc(temp.path());
        let first = rpc
            .dispatch("chat.abort", Some(json!({ "sessionKey": "main" })), false)
            .await
            .expect("dispatch");
        assert_eq!(first["ok"], json!(true));
        assert_eq!(first["aborted"], json!(false), "idle abort is a no-op");
        let second = rpc
            .dispatch("chat.abort", Some(json!({ "runId": "run-nope" })), false)
            .await
            .expect("dispatch");
        assert_eq!(second["ok"], json!(true));
    }

    #[tokio::test]
    async fn functional_config_round_trip_is_a_noop() {
        let temp = tempfile::tempdir().expect("tempdir");
        let rpc = rpc(temp.path());
        let current = rpc.dispatch("config.get", None, false).await.expect("get");
        let put = rpc
            .dispatch("config.put", Some(json!({ "config": current })), false)
            .await
            .expect("put");
        assert_eq!(put["ok"], json!(true));
        assert_eq!(
            put["changedPrefixes"],
            json!(Vec::<String>::new()),
            "config.put(config.get()) must not report changes"
        );
        let after = rpc.dispatch("config.get", None, false).await.expect("get");
        let before = rpc.dispatch("config.get", None, false).await.expect("get");
        assert_eq!(after, before);
    }

    #[tokio::test]
    async fn functional_sessions_patch_updates_levels() {
        let temp = tempfile::tempdir().expect("tempdir");
        let rpc = rpc(temp.path());
        let result = rpc
            .dispatch(
                "sessions.patch",
                Some(json!({ "sessionKey": "main", "thinkingLevel": "high" })),
                false,
            )
            .await
            .expect("dispatch");
        assert_eq!(result["entry"]["thinkingLevel"], json!("high"));

        let list = rpc.dispatch("sessions.list", None, false).await.expect("list");
        assert_eq!(list["sessions"][0]["key"], json!("main"));
    }

    #[tokio::test]
    async fn functional_pairing_approve_admits_peer_to_allowlist() {
        let temp = tempfile::tempdir().expect("tempdir");
        let rpc = rpc(temp.path());

        // Mint a request the way ingress would.
        let code = {
            let mut store = rpc.open_pairing_store("whatsapp").expect("store");
            store
                .create_request("+15550001111", clawdis_core::unix_time_secs())
                .expect("create")
                .code
        };
        let listed = rpc
            .dispatch("pairing.list", Some(json!({ "channel": "whatsapp" })), false)
            .await
            .expect("list");
        assert_eq!(listed["requests"].as_array().expect("array").len(), 1);

        let approved = rpc
            .dispatch(
                "pairing.approve",
                Some(json!({ "channel": "whatsapp", "code": code })),
                false,
            )
            .await
            .expect("approve");
        assert_eq!(approved["peer"], json!("+15550001111"));

        let config: Value = rpc.dispatch("config.get", None, false).await.expect("get");
        assert_eq!(
            config["channels"]["whatsapp"]["allowFrom"],
            json!(["+15550001111"])
        );
    }

    #[tokio::test]
    async fn unit_invalid_params_report_field_paths() {
        let temp = tempfile::tempdir().expect("tempdir");
        let rpc = rpc(temp.path());
        let error = rpc
            .dispatch("chat.send", Some(json!({})), false)
            .await
            .expect_err("missing message");
        assert_eq!(error.code(), "invalid-input");
        assert_eq!(error.field_path().as_deref(), Some("params.message"));

        let error = rpc
            .dispatch("sessions.patch", Some(json!({ "sessionKey": 7 })), false)
            .await
            .expect_err("non-string key");
        assert_eq!(error.field_path().as_deref(), Some("params.sessionKey"));
    }

    #[tokio::test]
    async fn functional_web_login_start_then_approve_then_wait() {
        let temp = tempfile::tempdir().expect("tempdir");
        let rpc = rpc(temp.path());
        let started = rpc.dispatch("web.login.start", None, false).await.expect("start");
        let code = started["code"].as_str().expect("code").to_string();
        rpc.dispatch("web.login.approve", Some(json!({ "code": code })), false)
            .await
            .expect("approve");
        let waited = rpc
            .dispatch("web.login.wait", Some(json!({ "code": code })), false)
            .await
            .expect("wait");
        assert_eq!(waited["approved"], json!(true));
    }

    #[test]
    fn unit_rpc_timeouts_have_method_overrides() {
        assert_eq!(rpc_timeout_ms("health", false), 10_000);
        assert_eq!(rpc_timeout_ms("chat.send", true), 120_000);
        assert_eq!(rpc_timeout_ms("chat.send", false), 10_000);
        assert_eq!(rpc_timeout_ms("web.login.wait", false), 60_000);
    }
}
