//! Heartbeat runtime.
//!
//! Periodically self-prompts the agent so it can speak up proactively.
//! Every trigger path (interval timer, wake request, RPC) converges on
//! `run_once`, which gates on lane business, resolves a delivery target,
//! checks channel readiness, and suppresses empty or sentinel-only replies.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clawdis_channel::{
    deliver_payloads, ChannelAdapter, ChannelRegistry, ChannelSurface, HeartbeatReadiness,
    OutboundPayload,
};
use clawdis_config::{ChannelSection, ClawdisConfig, HeartbeatTarget};
use clawdis_core::parse_every_duration;
use serde::Serialize;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::run_registry::RunState;
use crate::run_scheduler::SessionScheduler;

/// Reply sentinel meaning "nothing worth saying".
pub const HEARTBEAT_OK_SENTINEL: &str = "HEARTBEAT_OK";

const DEFAULT_HEARTBEAT_PROMPT: &str = "Periodic heartbeat. Review the conversation and anything \
pending. If there is something genuinely useful to tell the user, say it; otherwise reply with \
exactly HEARTBEAT_OK.";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
/// Outcome of one heartbeat cycle.
pub struct HeartbeatReport {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
}

impl HeartbeatReport {
    fn skipped(reason: impl Into<String>) -> Self {
        Self {
            status: "skipped".to_string(),
            reason: Some(reason.into()),
            channel: None,
            to: None,
        }
    }

    fn sent(channel: &str, to: &str) -> Self {
        Self {
            status: "sent".to_string(),
            reason: None,
            channel: Some(channel.to_string()),
            to: Some(to.to_string()),
        }
    }

    fn suppressed(reason: &str) -> Self {
        Self {
            status: "ok-quiet".to_string(),
            reason: Some(reason.to_string()),
            channel: None,
            to: None,
        }
    }
}

struct ResolvedTarget {
    surface: ChannelSurface,
    section: ChannelSection,
    to: String,
    substitution: Option<String>,
}

/// Public struct `HeartbeatRunner` used across Clawdis components.
pub struct HeartbeatRunner {
    scheduler: SessionScheduler,
    channels: Arc<ChannelRegistry>,
    config: std::sync::Mutex<ClawdisConfig>,
    http: reqwest::Client,
}

impl HeartbeatRunner {
    pub fn new(
        scheduler: SessionScheduler,
        channels: Arc<ChannelRegistry>,
        config: ClawdisConfig,
    ) -> Self {
        Self {
            scheduler,
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

    fn config_snapshot(&self) -> ClawdisConfig {
        self.config
            .lock()
            .map(|config| config.clone())
            .expect("heartbeat config lock poisoned")
    }

    /// One heartbeat cycle. Never errors outward for skip conditions; they
    /// come back as a skipped report with a named reason.
    pub async fn run_once(&self) -> Result<HeartbeatReport> {
        let config = self.config_snapshot();
        let main_key = config.session.main_key.clone();

        // Re-entrancy guard: queued work on the main lane wins.
        if self.scheduler.is_busy(&main_key).await {
            return Ok(HeartbeatReport::skipped("requests-in-flight"));
        }

        let target = match self.resolve_target(&config) {
            Ok(Some(target)) => target,
            Ok(None) => return Ok(HeartbeatReport::skipped("no-target")),
            Err(reason) => return Ok(HeartbeatReport::skipped(reason)),
        };

        let adapter = match self.channels.adapter(target.surface) {
            Some(adapter) => adapter,
            None => return Ok(HeartbeatReport::skipped("no-target")),
        };
        if let HeartbeatReadiness::Skip { reason } = adapter.heartbeat_readiness(&target.section) {
            debug!(target: "clawdis.heartbeat", reason = %reason, "heartbeat not ready");
            return Ok(HeartbeatReport::skipped(reason));
        }

        let prompt = config
            .agent
            .heartbeat
            .prompt
            .clone()
            .unwrap_or_else(|| DEFAULT_HEARTBEAT_PROMPT.to_string());

        // Remember the pre-run freshness so a heartbeat does not bump the
        // session in recency listings.
        let prior_updated_at = self
            .scheduler
            .with_store(|store| store.entry(&main_key).map(|entry| entry.updated_at));

        let (state, payloads) = self
            .scheduler
            .run_detached(&main_key, &prompt, false)
            .await?;

        if let Some(updated_at) = prior_updated_at {
            self.scheduler
                .with_store(|store| store.restore_updated_at(&main_key, updated_at))?;
        }

        if state != RunState::Final {
            return Ok(HeartbeatReport::skipped(format!(
                "run-{}",
                state.as_str()
            )));
        }

        // The last non-empty payload is the heartbeat's voice.
        let Some(payload) = payloads.iter().rev().find(|payload| !payload.is_empty()) else {
            return Ok(HeartbeatReport::suppressed("empty-reply"));
        };
        let stripped = payload.text.replace(HEARTBEAT_OK_SENTINEL, "");
        let stripped = stripped.trim();
        if stripped.is_empty() && payload.media_urls.is_empty() {
            return Ok(HeartbeatReport::suppressed("heartbeat-ok"));
        }

        let outbound = OutboundPayload {
            text: stripped.to_string(),
            media_urls: payload.media_urls.clone(),
            ..OutboundPayload::default()
        };
        let report = deliver_payloads(
            adapter.as_ref(),
            &target.to,
            &[outbound],
            target.section.media_max_mb,
            &self.http,
            None,
        )
        .await?;
        if !report.delivered_everything() {
            warn!(
                target: "clawdis.heartbeat",
                status = %report.status,
                "heartbeat delivery incomplete"
            );
        }
        if let Some(substitution) = target.substitution {
            info!(
                target: "clawdis.heartbeat",
                reason = %substitution,
                to = %target.to,
                "heartbeat target substituted"
            );
        }
        Ok(HeartbeatReport::sent(target.surface.as_str(), &target.to))
    }

    fn resolve_target(&self, config: &ClawdisConfig) -> Result<Option<ResolvedTarget>, String> {
        let heartbeat = &config.agent.heartbeat;
        let main_key = &config.session.main_key;

        let (surface, explicit_to) = match heartbeat.target {
            HeartbeatTarget::None => return Ok(None),
            HeartbeatTarget::Last => {
                let entry = self
                    .scheduler
                    .with_store(|store| store.entry(main_key).cloned());
                let Some(entry) = entry else {
                    return Ok(None);
                };
                let Some(channel) = entry.last_channel.clone() else {
                    return Ok(None);
                };
                // `webchat` can never be stored as last_channel; an unknown
                // or disabled adapter degrades to no-target.
                let Some(surface) = ChannelSurface::parse(&channel) else {
                    return Ok(None);
                };
                if !config.channel(surface.as_str()).enabled {
                    return Ok(None);
                }
                (surface, entry.last_to)
            }
            fixed => {
                let surface = ChannelSurface::parse(fixed.as_str())
                    .ok_or_else(|| "no-target".to_string())?;
                let entry = self
                    .scheduler
                    .with_store(|store| store.entry(main_key).cloned());
                let last_to = entry.as_ref().and_then(|entry| {
                    if entry.last_channel.as_deref() == Some(surface.as_str()) {
                        entry.last_to.clone()
                    } else {
                        None
                    }
                });
                (surface, heartbeat.to.clone().or(last_to))
            }
        };

        let section = config.channel(surface.as_str());
        let adapter = self
            .channels
            .adapter(surface)
            .ok_or_else(|| "no-target".to_string())?;
        let (resolved, substitution) = adapter.resolve_heartbeat_target(
            &section,
            explicit_to.as_deref(),
            None,
        );
        match resolved {
            Some(to) => Ok(Some(ResolvedTarget {
                surface,
                section,
                to,
                substitution,
            })),
            None => Ok(None),
        }
    }
}

/// Running heartbeat scheduler with interval + wake triggers.
pub struct HeartbeatHandle {
    wake: Arc<Notify>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    enabled: bool,
}

impl HeartbeatHandle {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// External wake: the next cycle fires after the coalesce window.
    pub fn request_heartbeat_now(&self) {
        self.wake.notify_one();
    }

    pub async fn shutdown(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

/// Starts the interval/wake loop. A zero or unparseable `every` disables the
/// scheduler; `run_once` remains callable through RPC either way.
pub fn start_heartbeat_scheduler(
    runner: Arc<HeartbeatRunner>,
    every: &str,
    coalesce_window: Duration,
) -> HeartbeatHandle {
    let wake = Arc::new(Notify::new());
    let Some(interval) = parse_every_duration(every) else {
        debug!(target: "clawdis.heartbeat", every, "heartbeat disabled");
        return HeartbeatHandle {
            wake,
            shutdown_tx: None,
            task: None,
            enabled: false,
        };
    };

    let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
    let loop_wake = Arc::clone(&wake);
    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = loop_wake.notified() => {
                    // Coalesce bursts of wakes into one cycle.
                    if !coalesce_window.is_zero() {
                        tokio::time::sleep(coalesce_window).await;
                    }
                }
                _ = &mut shutdown_rx => return,
            }
            match runner.run_once().await {
                Ok(report) => {
                    debug!(
                        target: "clawdis.heartbeat",
                        status = %report.status,
                        reason = report.reason.as_deref().unwrap_or(""),
                        "heartbeat cycle"
                    );
                }
                Err(error) => {
                    warn!(target: "clawdis.heartbeat", error = %error, "heartbeat cycle failed");
                }
            }
        }
    });

    HeartbeatHandle {
        wake,
        shutdown_tx: Some(shutdown_tx),
        task: Some(task),
        enabled: true,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use clawdis_channel::ChannelRegistry;
    use clawdis_config::{
        ChannelSection, ClawdisConfig, HeartbeatSection, HeartbeatTarget,
    };
    use clawdis_session::SessionStore;
    use tokio::sync::mpsc;

    use super::{HeartbeatRunner, HEARTBEAT_OK_SENTINEL};
    use crate::agent_engine::{
        AgentEngine, AgentRunRequest, AgentStreamEvent, CancellationFlag, RunMeta, RunOutcome,
        RunPayload,
    };
    use crate::run_scheduler::{
        NullOutputSink, SessionScheduler, SessionSchedulerConfig,
    };

    struct FixedEngine {
        reply: String,
    }

    #[async_trait]
    impl AgentEngine for FixedEngine {
        async fn run(
            &self,
            _request: AgentRunRequest,
            _events: mpsc::UnboundedSender<AgentStreamEvent>,
            _cancel: CancellationFlag,
        ) -> anyhow::Result<RunOutcome> {
            Ok(RunOutcome::Final {
                payloads: vec![RunPayload::from_raw_text(&self.reply)],
                meta: RunMeta::default(),
            })
        }
    }

    fn heartbeat_config(target: HeartbeatTarget, whatsapp_enabled: bool) -> ClawdisConfig {
        let mut config = ClawdisConfig::default();
        config.agent.heartbeat = HeartbeatSection {
            every: "5m".to_string(),
            target,
            to: Some("+15555550123".to_string()),
            prompt: None,
        };
        config.channels.insert(
            "whatsapp".to_string(),
            ChannelSection {
                enabled: whatsapp_enabled,
                ..ChannelSection::default()
            },
        );
        config
    }

    fn runner(reply: &str, config: ClawdisConfig, dir: &std::path::Path) -> HeartbeatRunner {
        let store = SessionStore::load(dir.join("sessions.json")).expect("store");
        let scheduler = SessionScheduler::new(
            Arc::new(FixedEngine {
                reply: reply.to_string(),
            }),
            store,
            Arc::new(NullOutputSink),
            SessionSchedulerConfig::from_config(&config, None),
        );
        let (channels, _webchat_rx) = ChannelRegistry::builtin();
        HeartbeatRunner::new(scheduler, Arc::new(channels), config)
    }

    #[tokio::test]
    async fn functional_missing_whatsapp_auth_skips_with_not_linked() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = runner(
            "anything",
            heartbeat_config(HeartbeatTarget::Whatsapp, true),
            temp.path(),
        );
        let report = runner.run_once().await.expect("run");
        assert_eq!(report.status, "skipped");
        assert_eq!(report.reason.as_deref(), Some("whatsapp-not-linked"));
    }

    #[tokio::test]
    async fn functional_target_none_skips_without_running() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = runner(
            "anything",
            heartbeat_config(HeartbeatTarget::None, true),
            temp.path(),
        );
        let report = runner.run_once().await.expect("run");
        assert_eq!(report.status, "skipped");
        assert_eq!(report.reason.as_deref(), Some("no-target"));
    }

    fn seed_last_route(runner: &HeartbeatRunner, channel: &str, to: &str) -> u64 {
        runner.scheduler.with_store(|store| {
            store.ensure_entry("main").expect("entry");
            store
                .record_run_result(
                    "main",
                    clawdis_session::SessionUsageDelta {
                        channel: Some(channel.to_string()),
                        to: Some(to.to_string()),
                        ..clawdis_session::SessionUsageDelta::default()
                    },
                )
                .expect("seed route")
                .updated_at
        })
    }

    #[tokio::test]
    async fn functional_sentinel_reply_suppresses_delivery_and_restores_recency() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut config = heartbeat_config(HeartbeatTarget::Last, true);
        config.channels.insert(
            "telegram".to_string(),
            ChannelSection {
                enabled: true,
                ..ChannelSection::default()
            },
        );
        let runner = runner(HEARTBEAT_OK_SENTINEL, config, temp.path());
        let before = seed_last_route(&runner, "telegram", "chat-42");

        let report = runner.run_once().await.expect("run");
        assert_eq!(report.status, "ok-quiet");
        assert_eq!(report.reason.as_deref(), Some("heartbeat-ok"));
        let after = runner
            .scheduler
            .with_store(|store| store.entry("main").expect("entry").updated_at);
        assert_eq!(after, before);
    }

    #[tokio::test]
    async fn functional_real_reply_attempts_delivery_on_last_route() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut config = heartbeat_config(HeartbeatTarget::Last, true);
        config.channels.insert(
            "telegram".to_string(),
            ChannelSection {
                enabled: true,
                ..ChannelSection::default()
            },
        );
        let runner = runner("the build finished", config, temp.path());
        seed_last_route(&runner, "telegram", "chat-42");

        // The builtin telegram adapter has no transport, so the delivery
        // fails with not-linked, but the cycle still reports the send route.
        let report = runner.run_once().await.expect("run");
        assert_eq!(report.status, "sent");
        assert_eq!(report.channel.as_deref(), Some("telegram"));
        assert_eq!(report.to.as_deref(), Some("chat-42"));
    }

    #[tokio::test]
    async fn regression_busy_main_lane_skips_with_requests_in_flight() {
        let temp = tempfile::tempdir().expect("tempdir");
        struct SlowEngine;
        #[async_trait]
        impl AgentEngine for SlowEngine {
            async fn run(
                &self,
                _request: AgentRunRequest,
                _events: mpsc::UnboundedSender<AgentStreamEvent>,
                cancel: CancellationFlag,
            ) -> anyhow::Result<RunOutcome> {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                    _ = cancel.cancelled() => {}
                }
                Ok(RunOutcome::Aborted)
            }
        }

        let config = heartbeat_config(HeartbeatTarget::Whatsapp, true);
        let store = SessionStore::load(temp.path().join("sessions.json")).expect("store");
        let scheduler = SessionScheduler::new(
            Arc::new(SlowEngine),
            store,
            Arc::new(NullOutputSink),
            SessionSchedulerConfig::from_config(&config, None),
        );
        let (channels, _webchat_rx) = ChannelRegistry::builtin();
        let runner = HeartbeatRunner::new(scheduler.clone(), Arc::new(channels), config);

        let envelope = clawdis_channel::ChannelEnvelope::new(
            clawdis_channel::ChannelSurface::Whatsapp,
            "+15555550123",
            "long question",
        );
        scheduler.handle_inbound(envelope).await.expect("inbound");
        tokio::time::sleep(Duration::from_millis(20)).await;

        let report = runner.run_once().await.expect("run");
        assert_eq!(report.status, "skipped");
        assert_eq!(report.reason.as_deref(), Some("requests-in-flight"));

        scheduler.abort_session("main").await;
    }

    #[tokio::test]
    async fn regression_disabled_last_channel_degrades_to_no_target() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut config = heartbeat_config(HeartbeatTarget::Last, true);
        config.channels.insert(
            "telegram".to_string(),
            ChannelSection {
                enabled: false,
                ..ChannelSection::default()
            },
        );
        let runner = runner("anything", config, temp.path());
        seed_last_route(&runner, "telegram", "chat-42");

        let report = runner.run_once().await.expect("run");
        assert_eq!(report.status, "skipped");
        assert_eq!(report.reason.as_deref(), Some("no-target"));
    }
}
