//! Gateway protocol server.
//!
//! JSON frames over a single WebSocket: a versioned `hello` handshake,
//! namespaced RPC dispatch, and event fan-out with per-connection monotonic
//! sequence numbers and gap recovery on resume.

pub mod gateway_auth;
pub mod gateway_events;
pub mod gateway_protocol;
pub mod gateway_rpc;
pub mod gateway_server;

pub use gateway_auth::{authorize_client, constant_time_eq, validate_bind_auth, AuthOutcome};
pub use gateway_events::{EventFrame, ResumeLedger, ResumeOutcome, EVENT_HISTORY_CAPACITY};
pub use gateway_protocol::{
    parse_client_frame, ClientFrame, ClientHello, GatewayError, RpcErrorBody, ServerFrame,
    PROTOCOL_VERSION, PROTOCOL_VERSION_MIN,
};
pub use gateway_rpc::{GatewayRpc, GatewayRpcDeps};
pub use gateway_server::{run_gateway_server, GatewayServerConfig, GatewayServerHandle};
