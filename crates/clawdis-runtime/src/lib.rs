//! The ingress→agent→egress dispatch core.
//!
//! Owns the per-session run scheduler (at most one active run per session
//! key), the agent engine seam, and the heartbeat and cron runtimes that
//! re-enter the scheduler with synthesized work.

pub mod agent_engine;
pub mod cron_runtime;
pub mod heartbeat_runtime;
pub mod ingress;
pub mod outbound_sink;
pub mod run_registry;
pub mod run_scheduler;

pub use agent_engine::{
    AgentEngine, AgentRunRequest, AgentStreamEvent, CancellationFlag, RunMeta, RunOutcome,
    RunPayload, CONTEXT_OVERFLOW_FALLBACK_REPLY,
};
pub use cron_runtime::{
    next_fire_unix_ms, run_due_jobs, CronJob, CronPayload, CronRunRecord, CronSchedule, CronStore,
    CronWakeMode,
};
pub use heartbeat_runtime::{
    start_heartbeat_scheduler, HeartbeatHandle, HeartbeatReport, HeartbeatRunner,
    HEARTBEAT_OK_SENTINEL,
};
pub use ingress::{IngressOutcome, IngressPipeline};
pub use outbound_sink::ChannelOutputSink;
pub use run_registry::{ActiveRunInfo, RunRegistry, RunState};
pub use run_scheduler::{
    NullOutputSink, QueuedEnvelope, RunOutputSink, SchedulerEvent, SessionScheduler,
    SessionSchedulerConfig, COLLECT_CURRENT_HEADER, COLLECT_HISTORY_HEADER,
};
