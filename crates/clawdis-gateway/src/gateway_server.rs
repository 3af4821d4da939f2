//! WebSocket server: handshake, connection loop, and event bridging.
//!
//! Each connection performs the versioned `hello` handshake, authorizes,
//! replays missed frames (or reports a gap), then serves RPC requests while
//! events stream through a bounded per-connection queue. A disconnect only
//! cancels RPCs that client was awaiting; detached runs keep going.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use clawdis_config::GatewayAuthSection;
use clawdis_core::unix_time_ms;
use clawdis_runtime::{AgentStreamEvent, SchedulerEvent};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::gateway_auth::{authorize_client, validate_bind_auth, AuthOutcome};
use crate::gateway_events::ResumeLedger;
use crate::gateway_events::ResumeOutcome;
use crate::gateway_protocol::{
    negotiate_protocol, parse_client_frame, ClientFrame, ClientHello, GatewayError, ServerFrame,
};
use crate::gateway_rpc::{rpc_timeout_ms, GatewayRpc};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECTION_SEND_QUEUE: usize = 128;
const EVENT_BUS_CAPACITY: usize = 512;

#[derive(Debug, Clone)]
struct PresenceEntry {
    client_name: String,
    mode: String,
    connected_at_ms: u64,
}

struct GatewayState {
    rpc: Arc<GatewayRpc>,
    auth: GatewayAuthSection,
    ledger: Arc<ResumeLedger>,
    presence: std::sync::Mutex<HashMap<String, PresenceEntry>>,
    event_bus: broadcast::Sender<(String, Value)>,
}

impl GatewayState {
    fn presence_payload(&self) -> Value {
        let presence = self.presence.lock().expect("presence lock poisoned");
        let clients = presence
            .iter()
            .map(|(instance_id, entry)| {
                json!({
                    "instanceId": instance_id,
                    "clientName": entry.client_name,
                    "mode": entry.mode,
                    "connectedAtMs": entry.connected_at_ms,
                })
            })
            .collect::<Vec<_>>();
        json!({ "clients": clients })
    }

    fn publish(&self, event: &str, payload: Value) {
        let _ = self.event_bus.send((event.to_string(), payload));
    }
}

/// Public struct `GatewayServerConfig` used across Clawdis components.
#[derive(Debug, Clone)]
pub struct GatewayServerConfig {
    pub bind: String,
    pub auth: GatewayAuthSection,
}

/// Running server handle.
pub struct GatewayServerHandle {
    pub local_addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl GatewayServerHandle {
    pub async fn shutdown(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

/// Binds and serves the gateway WebSocket endpoint at `/ws`.
pub async fn run_gateway_server(
    config: GatewayServerConfig,
    rpc: Arc<GatewayRpc>,
) -> Result<GatewayServerHandle> {
    let bind_addr = config
        .bind
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid gateway bind '{}'", config.bind))?;
    validate_bind_auth(&bind_addr, &config.auth)?;

    let (event_bus, _) = broadcast::channel(EVENT_BUS_CAPACITY);
    let state = Arc::new(GatewayState {
        rpc: Arc::clone(&rpc),
        auth: config.auth,
        ledger: Arc::new(ResumeLedger::new()),
        presence: std::sync::Mutex::new(HashMap::new()),
        event_bus,
    });

    // Bridge scheduler events onto the gateway bus.
    let bridge_state = Arc::clone(&state);
    let mut scheduler_events = rpc.scheduler().subscribe();
    tokio::spawn(async move {
        loop {
            match scheduler_events.recv().await {
                Ok(event) => bridge_scheduler_event(&bridge_state, event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(target: "clawdis.gateway", skipped, "event bridge lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    });

    // Periodic health fan-out so idle clients still see liveness.
    let health_state = Arc::clone(&state);
    let health_rpc = Arc::clone(&rpc);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let payload = health_rpc.snapshot(health_state.presence_payload()).await;
            health_state.publish("health", payload["health"].clone());
        }
    });

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind gateway on {bind_addr}"))?;
    let local_addr = listener
        .local_addr()
        .context("failed to resolve bound gateway address")?;
    info!(target: "clawdis.gateway", addr = %local_addr, "gateway listening");

    let app = Router::new()
        .route("/ws", get(handle_ws_upgrade))
        .with_state(state);

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        let serve = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        });
        if let Err(error) = serve.await {
            warn!(target: "clawdis.gateway", error = %error, "gateway server exited");
        }
    });

    Ok(GatewayServerHandle {
        local_addr,
        shutdown_tx: Some(shutdown_tx),
        task: Some(task),
    })
}

fn bridge_scheduler_event(state: &GatewayState, event: SchedulerEvent) {
    match event {
        SchedulerEvent::RunStarted {
            run_id,
            session_key,
        } => state.publish(
            "chat",
            json!({ "runId": run_id, "sessionKey": session_key, "state": "started" }),
        ),
        SchedulerEvent::Agent {
            run_id,
            session_key,
            event,
        } => {
            let payload = match &event {
                AgentStreamEvent::AssistantDelta { text } => {
                    json!({ "kind": "assistant_delta", "text": text })
                }
                AgentStreamEvent::AssistantMessage { text } => {
                    json!({ "kind": "assistant_message", "text": text })
                }
                AgentStreamEvent::ToolStart { name, args } => {
                    json!({ "kind": "tool_start", "name": name, "args": args })
                }
                AgentStreamEvent::ToolEnd { name, ok } => {
                    json!({ "kind": "tool_end", "name": name, "ok": ok })
                }
            };
            state.publish(
                "agent",
                json!({ "runId": run_id, "sessionKey": session_key, "event": payload }),
            );
        }
        SchedulerEvent::RunFinished {
            run_id,
            session_key,
            state: run_state,
            payloads,
            error,
        } => state.publish(
            "chat",
            json!({
                "runId": run_id,
                "sessionKey": session_key,
                "state": run_state.as_str(),
                "payloads": payloads,
                "error": error,
            }),
        ),
    }
}

async fn handle_ws_upgrade(
    State(state): State<Arc<GatewayState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: axum::http::HeaderMap,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    let header_map = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_ascii_lowercase(), value.to_string()))
        })
        .collect::<HashMap<_, _>>();
    upgrade.on_upgrade(move |socket| run_connection(state, socket, peer, header_map))
}

async fn run_connection(
    state: Arc<GatewayState>,
    socket: WebSocket,
    peer: SocketAddr,
    headers: HashMap<String, String>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Handshake: the first frame must be hello, within the timeout.
    let hello = match tokio::time::timeout(HANDSHAKE_TIMEOUT, ws_rx.next()).await {
        Ok(Some(Ok(Message::Text(raw)))) => match parse_client_frame(&raw) {
            Ok(ClientFrame::Hello(hello)) => hello,
            Ok(_) => {
                let _ = close_with(&mut ws_tx, "protocol-error", "expected hello frame").await;
                return;
            }
            Err(error) => {
                let _ = close_with(&mut ws_tx, "protocol-error", &error.to_string()).await;
                return;
            }
        },
        _ => {
            let _ = close_with(&mut ws_tx, "protocol-error", "handshake timed out").await;
            return;
        }
    };

    let Some(protocol) = negotiate_protocol(hello.min_protocol, hello.max_protocol) else {
        let _ = close_with(
            &mut ws_tx,
            "protocol-error",
            &format!(
                "no shared protocol in client range [{}, {}]",
                hello.min_protocol, hello.max_protocol
            ),
        )
        .await;
        return;
    };

    let outcome = authorize_client(
        &state.auth,
        hello.auth.as_ref(),
        peer.ip().is_loopback(),
        &headers,
    );
    let identity = match outcome {
        AuthOutcome::Granted { identity } => identity,
        AuthOutcome::Denied { reason } => {
            debug!(target: "clawdis.gateway", peer = %peer, reason = %reason, "connection denied");
            let _ = close_with(&mut ws_tx, "unauthorized", &reason).await;
            return;
        }
    };

    let instance_id = hello.instance_id.clone();
    register_presence(&state, &hello);
    info!(
        target: "clawdis.gateway",
        instance = %instance_id,
        client = %hello.client_name,
        identity = %identity,
        protocol,
        "client connected"
    );

    // helloOk first, then gap/replay so the client observes a contiguous
    // stream from its lastSeq.
    let snapshot = state.rpc.snapshot(state.presence_payload()).await;
    let hello_ok = ServerFrame::HelloOk { protocol, snapshot };
    if send_frame(&mut ws_tx, &hello_ok).await.is_err() {
        unregister_presence(&state, &instance_id);
        return;
    }
    match state.ledger.resume(&instance_id, hello.last_seq) {
        ResumeOutcome::Fresh => {}
        ResumeOutcome::Replay(frames) => {
            for frame in frames {
                if send_frame(&mut ws_tx, &ServerFrame::Event(frame)).await.is_err() {
                    unregister_presence(&state, &instance_id);
                    return;
                }
            }
        }
        ResumeOutcome::Gap {
            expected,
            received,
            replay,
        } => {
            if send_frame(&mut ws_tx, &ServerFrame::Gap { expected, received })
                .await
                .is_err()
            {
                unregister_presence(&state, &instance_id);
                return;
            }
            for frame in replay {
                if send_frame(&mut ws_tx, &ServerFrame::Event(frame)).await.is_err() {
                    unregister_presence(&state, &instance_id);
                    return;
                }
            }
        }
    }

    // Bounded per-connection queue; a slow consumer gets drop-oldest with a
    // gap marker instead of unbounded memory.
    let (frame_tx, mut frame_rx) = mpsc::channel::<ServerFrame>(CONNECTION_SEND_QUEUE);
    let forwarder = tokio::spawn(forward_bus_events(
        state.event_bus.subscribe(),
        Arc::clone(&state.ledger),
        instance_id.clone(),
        frame_tx.clone(),
    ));

    loop {
        tokio::select! {
            frame = frame_rx.recv() => {
                match frame {
                    Some(frame) => {
                        if send_frame(&mut ws_tx, &frame).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            message = ws_rx.next() => {
                match message {
                    Some(Ok(Message::Text(raw))) => {
                        handle_client_text(&state, &frame_tx, raw.as_str()).await;
                    }
                    Some(Ok(Message::Ping(_)) | Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        // Binary frames are outside the protocol.
                        let _ = frame_tx
                            .send(ServerFrame::Response {
                                id: "unknown".to_string(),
                                result: None,
                                error: Some(crate::gateway_protocol::RpcErrorBody {
                                    code: "protocol".to_string(),
                                    message: "binary frames are not supported".to_string(),
                                    field_path: None,
                                }),
                            })
                            .await;
                    }
                    Some(Err(error)) => {
                        debug!(target: "clawdis.gateway", error = %error, "socket read failed");
                        break;
                    }
                }
            }
        }
    }

    // Dropping the connection cancels only RPC futures spawned for this
    // client; detached runs continue inside the scheduler.
    forwarder.abort();
    unregister_presence(&state, &instance_id);
    info!(target: "clawdis.gateway", instance = %instance_id, "client disconnected");
}

async fn handle_client_text(
    state: &Arc<GatewayState>,
    frame_tx: &mpsc::Sender<ServerFrame>,
    raw: &str,
) {
    match parse_client_frame(raw) {
        Ok(ClientFrame::Request {
            id,
            method,
            params,
            expect_final,
        }) => {
            let rpc = Arc::clone(&state.rpc);
            let frame_tx = frame_tx.clone();
            tokio::spawn(async move {
                let timeout = Duration::from_millis(rpc_timeout_ms(&method, expect_final));
                let result =
                    tokio::time::timeout(timeout, rpc.dispatch(&method, params, expect_final))
                        .await;
                let frame = match result {
                    Ok(Ok(result)) => ServerFrame::response_ok(&id, result),
                    Ok(Err(error)) => ServerFrame::response_error(&id, &error),
                    Err(_) => {
                        ServerFrame::response_error(&id, &GatewayError::Timeout(method.clone()))
                    }
                };
                let _ = frame_tx.send(frame).await;
            });
        }
        Ok(ClientFrame::Hello(_)) => {
            let _ = frame_tx
                .send(ServerFrame::response_error(
                    "hello",
                    &GatewayError::Protocol("hello is only valid as the first frame".to_string()),
                ))
                .await;
        }
        Err(error) => {
            let _ = frame_tx
                .send(ServerFrame::response_error("unknown", &error))
                .await;
        }
    }
}

/// Stamps bus events for one instance and pushes them into the bounded
/// queue. When the queue is full the oldest unsent events are dropped and a
/// gap marker precedes the next delivered frame.
async fn forward_bus_events(
    mut bus_rx: broadcast::Receiver<(String, Value)>,
    ledger: Arc<ResumeLedger>,
    instance_id: String,
    frame_tx: mpsc::Sender<ServerFrame>,
) {
    let mut pending_gap: Option<u64> = None;
    loop {
        let (event, payload) = match bus_rx.recv().await {
            Ok(entry) => entry,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(
                    target: "clawdis.gateway",
                    instance = %instance_id,
                    skipped,
                    "event bus lagged"
                );
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };

        let frame = ledger.record(&instance_id, &event, payload);
        if let Some(first_dropped) = pending_gap {
            match frame_tx.try_send(ServerFrame::Gap {
                expected: first_dropped,
                received: frame.seq,
            }) {
                Ok(()) => pending_gap = None,
                Err(_) => continue,
            }
        }
        if frame_tx.try_send(ServerFrame::Event(frame.clone())).is_err() {
            pending_gap.get_or_insert(frame.seq);
        }
    }
}

fn register_presence(state: &GatewayState, hello: &ClientHello) {
    {
        let mut presence = state.presence.lock().expect("presence lock poisoned");
        presence.insert(
            hello.instance_id.clone(),
            PresenceEntry {
                client_name: hello.client_name.clone(),
                mode: hello.mode.clone(),
                connected_at_ms: unix_time_ms(),
            },
        );
    }
    state.publish("presence", state.presence_payload());
}

fn unregister_presence(state: &GatewayState, instance_id: &str) {
    {
        let mut presence = state.presence.lock().expect("presence lock poisoned");
        presence.remove(instance_id);
    }
    state.publish("presence", state.presence_payload());
}

async fn send_frame(
    ws_tx: &mut (impl SinkExt<Message> + Unpin),
    frame: &ServerFrame,
) -> Result<(), ()> {
    let rendered = serde_json::to_string(frame).map_err(|_| ())?;
    ws_tx
        .send(Message::Text(rendered.into()))
        .await
        .map_err(|_| ())
}

async fn close_with(
    ws_tx: &mut (impl SinkExt<Message> + Unpin),
    code: &str,
    message: &str,
) -> Result<(), ()> {
    let frame = ServerFrame::Response {
        id: code.to_string(),
        result: None,
        error: Some(crate::gateway_protocol::RpcErrorBody {
            code: code.to_string(),
            message: message.to_string(),
            field_path: None,
        }),
    };
    send_frame(ws_tx, &frame).await
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use clawdis_channel::ChannelRegistry;
    use clawdis_config::{save_config, ClawdisConfig, GatewayAuthMode, GatewayAuthSection, StateDir};
    use clawdis_runtime::{
        AgentEngine, AgentRunRequest, AgentStreamEvent, CancellationFlag, CronStore,
        HeartbeatRunner, NullOutputSink, RunMeta, RunOutcome, RunPayload, SessionScheduler,
        SessionSchedulerConfig,
    };
    use clawdis_session::SessionStore;
    use futures_util::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use tokio::sync::{mpsc, Mutex as AsyncMutex};
    use tokio_tungstenite::tungstenite::Message as ClientWsMessage;

    use super::{run_gateway_server, GatewayServerConfig};
    use crate::gateway_rpc::{GatewayRpc, GatewayRpcDeps};

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
            let _ = events.send(AgentStreamEvent::AssistantDelta {
                text: reply.clone(),
            });
            Ok(RunOutcome::Final {
                payloads: vec![RunPayload::text(reply)],
                meta: RunMeta::default(),
            })
        }
    }

    fn build_rpc(dir: &std::path::Path) -> Arc<GatewayRpc> {
        let state_dir = StateDir::new(dir);
        let config = ClawdisConfig::default();
        save_config(&state_dir.config_path(), &config).expect("save config");
        let store = SessionStore::load(state_dir.session_store_path()).expect("store");
        let scheduler = SessionScheduler::new(
            Arc::new(EchoEngine),
            store,
            Arc::new(NullOutputSink),
            SessionSchedulerConfig::from_config(&config, None),
        );
        let (channels, _webchat_rx) = ChannelRegistry::builtin();
        let channels = Arc::new(channels);
        let heartbeat = Arc::new(HeartbeatRunner::new(
            scheduler.clone(),
            Arc::clone(&channels),
            config,
        ));
        let cron =
            CronStore::open(state_dir.cron_jobs_path(), state_dir.cron_run_log_path())
                .expect("cron store");
        Arc::new(GatewayRpc::new(GatewayRpcDeps {
            scheduler,
            channels,
            heartbeat,
            cron: Arc::new(AsyncMutex::new(cron)),
            state_dir,
            started_at_ms: clawdis_core::unix_time_ms(),
        }))
    }

    async fn connect(
        addr: std::net::SocketAddr,
    ) -> tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    > {
        let (socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
            .await
            .expect("connect");
        socket
    }

    async fn next_json(
        socket: &mut tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    ) -> Value {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
                .await
                .expect("frame before timeout")
                .expect("stream open")
                .expect("frame ok");
            if let ClientWsMessage::Text(raw) = message {
                return serde_json::from_str(&raw).expect("json frame");
            }
        }
    }

    fn hello_frame(instance_id: &str, token: Option<&str>, last_seq: Option<u64>) -> String {
        let mut hello = json!({
            "type": "hello",
            "clientName": "test-client",
            "clientVersion": "0.0.1",
            "platform": "linux",
            "mode": "cli",
            "instanceId": instance_id,
            "minProtocol": 1,
            "maxProtocol": 3,
        });
        if let Some(token) = token {
            hello["auth"] = json!({ "token": token });
        }
        if let Some(last_seq) = last_seq {
            hello["lastSeq"] = json!(last_seq);
        }
        hello.to_string()
    }

    #[tokio::test]
    async fn integration_handshake_rpc_and_chat_events_flow() {
        let temp = tempfile::tempdir().expect("tempdir");
        let rpc = build_rpc(temp.path());
        let mut handle = run_gateway_server(
            GatewayServerConfig {
                bind: "127.0.0.1:0".to_string(),
                auth: GatewayAuthSection::default(),
            },
            rpc,
        )
        .await
        .expect("server");

        let mut socket = connect(handle.local_addr).await;
        socket
            .send(ClientWsMessage::Text(hello_frame("inst-1", None, None).into()))
            .await
            .expect("send hello");
        let hello_ok = next_json(&mut socket).await;
        assert_eq!(hello_ok["type"], json!("helloOk"));
        assert_eq!(hello_ok["protocol"], json!(3));
        assert_eq!(hello_ok["snapshot"]["health"]["status"], json!("ok"));

        socket
            .send(ClientWsMessage::Text(
                json!({
                    "type": "request",
                    "id": "r1",
                    "method": "chat.send",
                    "params": { "message": "ping" }
                })
                .to_string()
                .into(),
            ))
            .await
            .expect("send rpc");

        let mut saw_response = false;
        let mut saw_final_chat = false;
        for _ in 0..12 {
            let frame = next_json(&mut socket).await;
            match frame["type"].as_str() {
                Some("response") if frame["id"] == json!("r1") => {
                    assert!(frame["result"]["runId"].is_string());
                    saw_response = true;
                }
                Some("event") if frame["event"] == json!("chat") => {
                    let seq = frame["seq"].as_u64().expect("seq");
                    assert!(seq >= 1);
                    if frame["payload"]["state"] == json!("final") {
                        assert_eq!(
                            frame["payload"]["payloads"][0]["text"],
                            json!("echo: ping")
                        );
                        saw_final_chat = true;
                    }
                }
                _ => {}
            }
            if saw_response && saw_final_chat {
                break;
            }
        }
        assert!(saw_response, "rpc response must arrive");
        assert!(saw_final_chat, "terminal chat event must arrive");

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn integration_event_sequences_are_contiguous_per_connection() {
        let temp = tempfile::tempdir().expect("tempdir");
        let rpc = build_rpc(temp.path());
        let mut handle = run_gateway_server(
            GatewayServerConfig {
                bind: "127.0.0.1:0".to_string(),
                auth: GatewayAuthSection::default(),
            },
            rpc,
        )
        .await
        .expect("server");

        let mut socket = connect(handle.local_addr).await;
        socket
            .send(ClientWsMessage::Text(hello_frame("inst-seq", None, None).into()))
            .await
            .expect("send hello");
        let _hello_ok = next_json(&mut socket).await;

        socket
            .send(ClientWsMessage::Text(
                json!({
                    "type": "request",
                    "id": "r1",
                    "method": "chat.send",
                    "params": { "message": "one" },
                    "expectFinal": true
                })
                .to_string()
                .into(),
            ))
            .await
            .expect("send rpc");

        let mut last_seq = 0u64;
        let mut events_seen = 0;
        for _ in 0..16 {
            let frame = next_json(&mut socket).await;
            if frame["type"] == json!("event") {
                let seq = frame["seq"].as_u64().expect("seq");
                assert_eq!(seq, last_seq + 1, "seq must increase by exactly one");
                last_seq = seq;
                events_seen += 1;
            }
            if frame["type"] == json!("response") && frame["id"] == json!("r1") {
                break;
            }
        }
        assert!(events_seen >= 2, "expected chat + agent events");

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn integration_invalid_token_is_denied() {
        let temp = tempfile::tempdir().expect("tempdir");
        let rpc = build_rpc(temp.path());
        let mut handle = run_gateway_server(
            GatewayServerConfig {
                bind: "127.0.0.1:0".to_string(),
                auth: GatewayAuthSection {
                    mode: GatewayAuthMode::Token,
                    token: Some("right-token".to_string()),
                    password: None,
                },
            },
            rpc,
        )
        .await
        .expect("server");

        let mut socket = connect(handle.local_addr).await;
        socket
            .send(ClientWsMessage::Text(
                hello_frame("inst-bad", Some("wrong-token"), None).into(),
            ))
            .await
            .expect("send hello");
        let denial = next_json(&mut socket).await;
        assert_eq!(denial["error"]["code"], json!("unauthorized"));

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn integration_reconnect_with_stale_last_seq_gets_gap() {
        let temp = tempfile::tempdir().expect("tempdir");
        let rpc = build_rpc(temp.path());
        let mut handle = run_gateway_server(
            GatewayServerConfig {
                bind: "127.0.0.1:0".to_string(),
                auth: GatewayAuthSection::default(),
            },
            rpc.clone(),
        )
        .await
        .expect("server");

        // First connection generates traffic for this instance.
        let mut socket = connect(handle.local_addr).await;
        socket
            .send(ClientWsMessage::Text(hello_frame("inst-gap", None, None).into()))
            .await
            .expect("send hello");
        let _hello_ok = next_json(&mut socket).await;
        for round in 0..3 {
            socket
                .send(ClientWsMessage::Text(
                    json!({
                        "type": "request",
                        "id": format!("r{round}"),
                        "method": "chat.send",
                        "params": { "message": format!("msg {round}") },
                        "expectFinal": true
                    })
                    .to_string()
                    .into(),
                ))
                .await
                .expect("send rpc");
            loop {
                let frame = next_json(&mut socket).await;
                if frame["type"] == json!("response")
                    && frame["id"] == json!(format!("r{round}"))
                {
                    break;
                }
            }
        }
        drop(socket);
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Reconnect claiming an impossible past: lastSeq=0 is older than any
        // retained frame once history rolls, but with a short history the
        // replay path applies; claiming a seq in range replays the tail.
        let mut socket = connect(handle.local_addr).await;
        socket
            .send(ClientWsMessage::Text(hello_frame("inst-gap", None, Some(1)).into()))
            .await
            .expect("send hello");
        let hello_ok = next_json(&mut socket).await;
        assert_eq!(hello_ok["type"], json!("helloOk"));
        let next = next_json(&mut socket).await;
        match next["type"].as_str() {
            Some("event") => {
                assert_eq!(next["seq"], json!(2), "replay resumes right after lastSeq");
            }
            Some("gap") => {
                assert_eq!(next["expected"], json!(2));
            }
            other => panic!("expected replay or gap, got {other:?}"),
        }

        handle.shutdown().await;
    }
}
