//! Run registry: at most one non-terminal run per session key.
//!
//! The registry owns every run's cancellation flag, steer channel, and
//! state watch. `abort` is idempotent and acknowledged only when the engine
//! observes the flag and the run reaches `aborted`.

use std::collections::HashMap;

use anyhow::{bail, Result};
use clawdis_channel::channel_outbound::DeliveryAbort;
use clawdis_core::{generate_run_id, unix_time_ms};
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex};

use crate::agent_engine::CancellationFlag;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
/// Enumerates supported `RunState` values.
pub enum RunState {
    Pending,
    Streaming,
    AwaitingFinal,
    Aborted,
    Final,
    Error,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Aborted | Self::Final | Self::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Streaming => "streaming",
            Self::AwaitingFinal => "awaiting-final",
            Self::Aborted => "aborted",
            Self::Final => "final",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone)]
/// Handle to one active run, shared between scheduler and RPC surfaces.
pub struct ActiveRunInfo {
    pub run_id: String,
    pub session_key: String,
    pub started_at_ms: u64,
    pub idempotency_key: String,
    pub cancel: CancellationFlag,
    pub delivery_abort: DeliveryAbort,
    pub steer_tx: mpsc::UnboundedSender<String>,
    pub state_rx: watch::Receiver<RunState>,
}

struct RegisteredRun {
    info: ActiveRunInfo,
    state_tx: watch::Sender<RunState>,
}

#[derive(Default)]
/// Public struct `RunRegistry` used across Clawdis components.
pub struct RunRegistry {
    active: Mutex<HashMap<String, RegisteredRun>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new run for `session_key`, returning its handle plus the
    /// steer receiver the engine consumes. Fails while another run on the
    /// same key is non-terminal.
    pub async fn begin(
        &self,
        session_key: &str,
        idempotency_key: &str,
    ) -> Result<(ActiveRunInfo, mpsc::UnboundedReceiver<String>)> {
        let mut active = self.active.lock().await;
        if let Some(existing) = active.get(session_key) {
            if !existing.state_tx.borrow().is_terminal() {
                bail!(
                    "session '{}' already has active run {}",
                    session_key,
                    existing.info.run_id
                );
            }
        }

        let (steer_tx, steer_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(RunState::Pending);
        let info = ActiveRunInfo {
            run_id: generate_run_id(),
            session_key: session_key.to_string(),
            started_at_ms: unix_time_ms(),
            idempotency_key: idempotency_key.to_string(),
            cancel: CancellationFlag::new(),
            delivery_abort: DeliveryAbort::new(),
            steer_tx,
            state_rx,
        };
        active.insert(
            session_key.to_string(),
            RegisteredRun {
                info: info.clone(),
                state_tx,
            },
        );
        Ok((info, steer_rx))
    }

    pub async fn active_run(&self, session_key: &str) -> Option<ActiveRunInfo> {
        let active = self.active.lock().await;
        active
            .get(session_key)
            .filter(|run| !run.state_tx.borrow().is_terminal())
            .map(|run| run.info.clone())
    }

    pub async fn has_active_run(&self, session_key: &str) -> bool {
        self.active_run(session_key).await.is_some()
    }

    pub async fn active_runs(&self) -> Vec<ActiveRunInfo> {
        let active = self.active.lock().await;
        active
            .values()
            .filter(|run| !run.state_tx.borrow().is_terminal())
            .map(|run| run.info.clone())
            .collect()
    }

    /// Moves a run to a non-terminal progress state.
    pub async fn set_state(&self, session_key: &str, run_id: &str, state: RunState) {
        let active = self.active.lock().await;
        if let Some(run) = active.get(session_key) {
            if run.info.run_id == run_id {
                let _ = run.state_tx.send(state);
            }
        }
    }

    /// Records the terminal state and releases the session's queue slot.
    pub async fn finish(&self, session_key: &str, run_id: &str, state: RunState) {
        debug_assert!(state.is_terminal());
        let mut active = self.active.lock().await;
        if let Some(run) = active.get(session_key) {
            if run.info.run_id != run_id {
                return;
            }
            let _ = run.state_tx.send(state);
        }
        active.remove(session_key);
    }

    /// Requests cancellation by run id. Idempotent; unknown or finished run
    /// ids are a successful no-op.
    pub async fn abort(&self, run_id: &str) -> bool {
        let active = self.active.lock().await;
        for run in active.values() {
            if run.info.run_id == run_id && !run.state_tx.borrow().is_terminal() {
                run.info.cancel.cancel();
                run.info.delivery_abort.abort();
                return true;
            }
        }
        false
    }

    /// Requests cancellation of whatever run a session has in flight.
    pub async fn abort_session(&self, session_key: &str) -> bool {
        let active = self.active.lock().await;
        match active.get(session_key) {
            Some(run) if !run.state_tx.borrow().is_terminal() => {
                run.info.cancel.cancel();
                run.info.delivery_abort.abort();
                true
            }
            _ => false,
        }
    }
}

/// Awaits a run's terminal state through its watch channel.
pub async fn wait_for_terminal(mut state_rx: watch::Receiver<RunState>) -> RunState {
    loop {
        let current = *state_rx.borrow();
        if current.is_terminal() {
            return current;
        }
        if state_rx.changed().await.is_err() {
            return *state_rx.borrow();
        }
    }
}
