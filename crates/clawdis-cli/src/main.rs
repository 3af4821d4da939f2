//! Clawdis command line entry point.

mod bootstrap;
mod cli_args;
mod deep_link;
mod engine;

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use clawdis_channel::adapters::{
    DiscordAdapter, ImessageAdapter, SignalAdapter, SlackAdapter, TelegramAdapter,
    WebchatAdapter, WhatsappAdapter,
};
use clawdis_channel::{ChannelAdapter, ChannelRegistry, ChannelSurface};
use clawdis_config::{load_config, ClawdisConfig, StateDir};
use clawdis_core::unix_time_ms;
use clawdis_gateway::{run_gateway_server, GatewayRpc, GatewayRpcDeps, GatewayServerConfig};
use clawdis_runtime::{
    run_due_jobs, start_heartbeat_scheduler, ChannelOutputSink, CronStore, HeartbeatRunner,
    SessionScheduler, SessionSchedulerConfig,
};
use clawdis_session::SessionStore;
use serde_json::json;
use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;

use cli_args::{
    ChannelsCommand, Cli, Command, CronCommand, GatewayCommand, HeartbeatCommand, SessionsCommand,
};
use deep_link::parse_agent_deep_link;
use engine::{HttpChatEngine, HttpChatEngineConfig};

const CRON_TICK_SECONDS: u64 = 30;
const HEARTBEAT_COALESCE_MS: u64 = 2_000;

struct Runtime {
    state_dir: StateDir,
    config: ClawdisConfig,
    rpc: Arc<GatewayRpc>,
    heartbeat_runner: Arc<HeartbeatRunner>,
    cron: Arc<AsyncMutex<CronStore>>,
    scheduler: SessionScheduler,
}

fn build_channel_registry(state_dir: &StateDir) -> Arc<ChannelRegistry> {
    let whatsapp = WhatsappAdapter::new(None);
    whatsapp.set_auth_path(state_dir.channel_credentials_path("whatsapp", "auth"));
    let (webchat, _webchat_rx) = WebchatAdapter::new_with_queue();

    let mut adapters: BTreeMap<ChannelSurface, Arc<dyn ChannelAdapter>> = BTreeMap::new();
    adapters.insert(ChannelSurface::Whatsapp, Arc::new(whatsapp));
    adapters.insert(ChannelSurface::Telegram, Arc::new(TelegramAdapter::new(None)));
    adapters.insert(ChannelSurface::Discord, Arc::new(DiscordAdapter::new(None)));
    adapters.insert(ChannelSurface::Signal, Arc::new(SignalAdapter::new(None)));
    adapters.insert(ChannelSurface::Imessage, Arc::new(ImessageAdapter::new(None)));
    adapters.insert(ChannelSurface::Slack, Arc::new(SlackAdapter::new(None)));
    adapters.insert(ChannelSurface::Webchat, Arc::new(webchat));
    Arc::new(ChannelRegistry::from_adapters(adapters))
}

fn build_runtime(state_dir_override: Option<&str>) -> Result<Runtime> {
    let state_dir = match state_dir_override {
        Some(path) => StateDir::new(path),
        None => StateDir::resolve()?,
    };
    let config = load_config(&state_dir.config_path())?;

    let channels = build_channel_registry(&state_dir);
    let engine = HttpChatEngine::new(HttpChatEngineConfig::resolve(
        config.agent.model.as_deref(),
    ))?;
    let sink = Arc::new(ChannelOutputSink::new(
        Arc::clone(&channels),
        config.clone(),
    ));
    let store = SessionStore::load(state_dir.session_store_path())?;
    let scheduler = SessionScheduler::new(
        Arc::new(engine),
        store,
        sink,
        SessionSchedulerConfig::from_config(&config, Some(state_dir.sessions_dir())),
    );
    let heartbeat_runner = Arc::new(HeartbeatRunner::new(
        scheduler.clone(),
        Arc::clone(&channels),
        config.clone(),
    ));
    let cron = Arc::new(AsyncMutex::new(CronStore::open(
        state_dir.cron_jobs_path(),
        state_dir.cron_run_log_path(),
    )?));

    let rpc = Arc::new(GatewayRpc::new(GatewayRpcDeps {
        scheduler: scheduler.clone(),
        channels,
        heartbeat: Arc::clone(&heartbeat_runner),
        cron: Arc::clone(&cron),
        state_dir: state_dir.clone(),
        started_at_ms: unix_time_ms(),
    }));

    Ok(Runtime {
        state_dir,
        config,
        rpc,
        heartbeat_runner,
        cron,
        scheduler,
    })
}

async fn run_gateway(runtime: Runtime, bind_override: Option<String>) -> Result<()> {
    let bind = bind_override.unwrap_or_else(|| runtime.config.gateway.bind.clone());
    let mut server = run_gateway_server(
        GatewayServerConfig {
            bind,
            auth: runtime.config.gateway.auth.clone(),
        },
        Arc::clone(&runtime.rpc),
    )
    .await?;
    println!(
        "gateway listening: addr={} state_dir={}",
        server.local_addr,
        runtime.state_dir.root().display()
    );
    let startup_line = json!({
        "event": "gateway_started",
        "timestamp_unix_ms": unix_time_ms(),
        "addr": server.local_addr.to_string(),
    });
    if let Err(error) = clawdis_core::append_daily_log_line(
        &runtime.state_dir.log_dir(),
        "clawdis",
        &startup_line.to_string(),
        clawdis_core::DEFAULT_LOG_KEEP_DAYS,
    ) {
        warn!(target: "clawdis.cli", error = %error, "failed to write startup log line");
    }

    let mut heartbeat = start_heartbeat_scheduler(
        Arc::clone(&runtime.heartbeat_runner),
        &runtime.config.agent.heartbeat.every,
        Duration::from_millis(HEARTBEAT_COALESCE_MS),
    );

    // Cron ticker: checks due jobs and wakes the heartbeat when asked.
    let cron = Arc::clone(&runtime.cron);
    let scheduler = runtime.scheduler.clone();
    let main_key = scheduler.main_key();
    let wake_notify = Arc::new(tokio::sync::Notify::new());
    let cron_wake = Arc::clone(&wake_notify);
    let cron_task = tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(CRON_TICK_SECONDS)).await;
            let mut store = cron.lock().await;
            let wake = {
                let cron_wake = Arc::clone(&cron_wake);
                move || cron_wake.notify_one()
            };
            if let Err(error) = run_due_jobs(
                &mut store,
                &scheduler,
                &main_key,
                wake,
                clawdis_core::unix_time_ms(),
            )
            .await
            {
                warn!(target: "clawdis.cron", error = %error, "cron tick failed");
            }
        }
    });
    let heartbeat_waker = {
        let notify = Arc::clone(&wake_notify);
        let runner = Arc::clone(&runtime.heartbeat_runner);
        tokio::spawn(async move {
            loop {
                notify.notified().await;
                if let Err(error) = runner.run_once().await {
                    warn!(target: "clawdis.heartbeat", error = %error, "woken heartbeat failed");
                }
            }
        })
    };

    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for ctrl-c")?;
    println!("shutting down");
    cron_task.abort();
    heartbeat_waker.abort();
    heartbeat.shutdown().await;
    server.shutdown().await;
    Ok(())
}

async fn run_agent_turn(
    runtime: &Runtime,
    message: &str,
    deliver: bool,
    channel: Option<&str>,
    to: Option<&str>,
    timeout_seconds: Option<u64>,
) -> Result<()> {
    let params = json!({ "message": message });
    let dispatch = runtime.rpc.dispatch("chat.send", Some(params), true);
    let result = match timeout_seconds {
        Some(seconds) => {
            match tokio::time::timeout(Duration::from_secs(seconds), dispatch).await {
                Ok(result) => result,
                Err(_) => {
                    runtime.scheduler.abort_session(&runtime.scheduler.main_key()).await;
                    bail!("agent run timed out after {seconds}s");
                }
            }
        }
        None => dispatch.await,
    }
    .map_err(|error| anyhow::anyhow!("{error}"))?;

    let payloads = result["payloads"].as_array().cloned().unwrap_or_default();
    for payload in &payloads {
        if let Some(text) = payload["text"].as_str() {
            println!("{text}");
        }
    }

    if deliver {
        let (Some(channel), Some(to)) = (channel, to) else {
            bail!("--deliver requires --channel and --to");
        };
        let surface = ChannelSurface::parse(channel)
            .with_context(|| format!("unknown channel '{channel}'"))?;
        let registry = build_channel_registry(&runtime.state_dir);
        let Some(adapter) = registry.adapter(surface) else {
            bail!("no adapter for channel '{channel}'");
        };
        let section = runtime.config.channel(channel);
        let outbound = payloads
            .iter()
            .filter_map(|payload| payload["text"].as_str())
            .map(clawdis_channel::OutboundPayload::text)
            .collect::<Vec<_>>();
        let report = clawdis_channel::deliver_payloads(
            adapter.as_ref(),
            to,
            &outbound,
            section.media_max_mb,
            &reqwest::Client::new(),
            None,
        )
        .await?;
        println!("delivery: status={} receipts={}", report.status, report.receipts.len());
    }
    Ok(())
}

fn confirm_interactive(prompt: &str) -> Result<bool> {
    print!("{prompt} [y/N] ");
    std::io::stdout().flush().context("failed to flush stdout")?;
    let mut answer = String::new();
    std::io::stdin()
        .read_line(&mut answer)
        .context("failed to read confirmation")?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

#[tokio::main]
async fn main() -> Result<()> {
    bootstrap::init_tracing();
    let cli = Cli::parse();
    let state_dir = cli.state_dir.as_deref();

    match cli.command {
        Command::Gateway {
            command: GatewayCommand::Run { bind },
        } => {
            let runtime = build_runtime(state_dir)?;
            run_gateway(runtime, bind).await
        }
        Command::Channels { command } => {
            let runtime = build_runtime(state_dir)?;
            match command {
                ChannelsCommand::Status => {
                    let result = runtime
                        .rpc
                        .dispatch("channels.status", None, false)
                        .await
                        .map_err(|error| anyhow::anyhow!("{error}"))?;
                    println!("{}", serde_json::to_string_pretty(&result)?);
                    Ok(())
                }
                ChannelsCommand::Logout { channel } => {
                    let result = runtime
                        .rpc
                        .dispatch(
                            "channels.logout",
                            Some(json!({ "channel": channel })),
                            false,
                        )
                        .await
                        .map_err(|error| anyhow::anyhow!("{error}"))?;
                    println!("{}", serde_json::to_string_pretty(&result)?);
                    Ok(())
                }
            }
        }
        Command::Sessions {
            command: SessionsCommand::List,
        } => {
            let runtime = build_runtime(state_dir)?;
            let result = runtime
                .rpc
                .dispatch("sessions.list", None, false)
                .await
                .map_err(|error| anyhow::anyhow!("{error}"))?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Command::Cron { command } => {
            let runtime = build_runtime(state_dir)?;
            let (method, params) = match command {
                CronCommand::List => ("cron.list", None),
                CronCommand::Status => ("cron.status", None),
                CronCommand::Run { job_id } => ("cron.run", Some(json!({ "jobId": job_id }))),
            };
            let result = runtime
                .rpc
                .dispatch(method, params, false)
                .await
                .map_err(|error| anyhow::anyhow!("{error}"))?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Command::Heartbeat {
            command: HeartbeatCommand::Now,
        } => {
            let runtime = build_runtime(state_dir)?;
            let report = runtime.heartbeat_runner.run_once().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Agent {
            message,
            deliver,
            channel,
            to,
            timeout_seconds,
        } => {
            let runtime = build_runtime(state_dir)?;
            run_agent_turn(
                &runtime,
                &message,
                deliver,
                channel.as_deref(),
                to.as_deref(),
                timeout_seconds,
            )
            .await
        }
        Command::Open { url, yes } => {
            let runtime = build_runtime(state_dir)?;
            let link = parse_agent_deep_link(&url)?;

            let authorized = match &link.key {
                Some(key) => {
                    let expected = runtime.config.gateway.auth.token.as_deref();
                    match expected {
                        Some(expected)
                            if clawdis_gateway::constant_time_eq(key, expected) =>
                        {
                            true
                        }
                        _ => bail!("deep link key does not match the gateway token"),
                    }
                }
                None => {
                    yes || confirm_interactive(&format!(
                        "Run agent message \"{}\"?",
                        link.message
                    ))?
                }
            };
            if !authorized {
                println!("cancelled");
                return Ok(());
            }

            run_agent_turn(
                &runtime,
                &link.message,
                link.deliver,
                link.channel.as_deref(),
                link.to.as_deref(),
                link.timeout_seconds,
            )
            .await
        }
    }
}
