//! Gateway wire frames and protocol versioning.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::gateway_events::EventFrame;

/// Oldest protocol revision this server still speaks.
pub const PROTOCOL_VERSION_MIN: u32 = 1;
/// Current protocol revision.
pub const PROTOCOL_VERSION: u32 = 3;

pub const DEFAULT_RPC_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
/// Credentials carried inside `hello`.
pub struct AuthPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
/// Public struct `ClientHello` used across Clawdis components.
pub struct ClientHello {
    pub client_name: String,
    #[serde(default)]
    pub client_version: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub mode: String,
    pub instance_id: String,
    #[serde(default = "min_protocol_default")]
    pub min_protocol: u32,
    #[serde(default = "max_protocol_default")]
    pub max_protocol: u32,
    /// Last event sequence this client observed; drives resume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seq: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthPayload>,
}

fn min_protocol_default() -> u32 {
    PROTOCOL_VERSION_MIN
}

fn max_protocol_default() -> u32 {
    PROTOCOL_VERSION
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
/// Enumerates supported `ClientFrame` values.
pub enum ClientFrame {
    Hello(ClientHello),
    #[serde(rename_all = "camelCase")]
    Request {
        id: String,
        method: String,
        #[serde(default)]
        params: Option<Value>,
        /// Block the response until the operation's terminal event.
        #[serde(default)]
        expect_final: bool,
    },
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
/// RPC error body with a stable kind code and optional field path.
pub struct RpcErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
/// Enumerates supported `ServerFrame` values.
pub enum ServerFrame {
    #[serde(rename_all = "camelCase")]
    HelloOk { protocol: u32, snapshot: Value },
    #[serde(rename_all = "camelCase")]
    Response {
        id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<RpcErrorBody>,
    },
    Event(EventFrame),
    #[serde(rename_all = "camelCase")]
    Gap { expected: u64, received: u64 },
}

impl ServerFrame {
    pub fn response_ok(id: &str, result: Value) -> Self {
        Self::Response {
            id: id.to_string(),
            result: Some(result),
            error: None,
        }
    }

    pub fn response_error(id: &str, error: &GatewayError) -> Self {
        Self::Response {
            id: id.to_string(),
            result: None,
            error: Some(RpcErrorBody {
                code: error.code().to_string(),
                message: error.to_string(),
                field_path: error.field_path(),
            }),
        }
    }
}

#[derive(Debug, thiserror::Error)]
/// Enumerates supported `GatewayError` values.
pub enum GatewayError {
    #[error("unauthorized: {0}")]
    Auth(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("invalid input: {message}")]
    InvalidInput { field_path: String, message: String },
    #[error("chat not found: recipient '{0}' is unknown on this channel")]
    ChatNotFound(String),
    #[error("method '{0}' timed out")]
    Timeout(String),
    #[error("{0}")]
    Internal(String),
}

impl GatewayError {
    pub fn invalid_input(field_path: &str, message: impl Into<String>) -> Self {
        Self::InvalidInput {
            field_path: field_path.to_string(),
            message: message.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Auth(_) => "auth",
            Self::Protocol(_) => "protocol",
            Self::InvalidInput { .. } => "invalid-input",
            Self::ChatNotFound(_) => "chat-not-found",
            Self::Timeout(_) => "timeout",
            Self::Internal(_) => "internal",
        }
    }

    pub fn field_path(&self) -> Option<String> {
        match self {
            Self::InvalidInput { field_path, .. } => Some(field_path.clone()),
            _ => None,
        }
    }
}

/// Parses one client frame, mapping malformed JSON to a protocol error.
pub fn parse_client_frame(raw: &str) -> Result<ClientFrame, GatewayError> {
    serde_json::from_str::<ClientFrame>(raw)
        .map_err(|error| GatewayError::Protocol(format!("malformed frame: {error}")))
}

/// Picks the protocol revision both sides speak, if any.
pub fn negotiate_protocol(client_min: u32, client_max: u32) -> Option<u32> {
    let low = client_min.max(PROTOCOL_VERSION_MIN);
    let high = client_max.min(PROTOCOL_VERSION);
    if low <= high {
        Some(high)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn unit_parse_client_frame_reads_hello_and_request() {
        let hello = parse_client_frame(
            r#"{
  "type": "hello",
  "clientName": "webchat",
  "instanceId": "inst-1",
  "minProtocol": 1,
  "maxProtocol": 3,
  "lastSeq": 41,
  "auth": {"token": "secret"}
}"#,
        )
        .expect("parse hello");
        match hello {
            ClientFrame::Hello(hello) => {
                assert_eq!(hello.client_name, "webchat");
                assert_eq!(hello.last_seq, Some(41));
                assert_eq!(hello.auth.expect("auth").token.as_deref(), Some("secret"));
            }
            other => panic!("expected hello, got {other:?}"),
        }

        let request = parse_client_frame(
            r#"{"type": "request", "id": "r1", "method": "health", "expectFinal": true}"#,
        )
        .expect("parse request");
        match request {
            ClientFrame::Request {
                id,
                method,
                expect_final,
                ..
            } => {
                assert_eq!(id, "r1");
                assert_eq!(method, "health");
                assert!(expect_final);
            }
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn unit_parse_client_frame_flags_malformed_json_as_protocol_error() {
        let error = parse_client_frame("not json").expect_err("should fail");
        assert_eq!(error.code(), "protocol");
    }

    #[test]
    fn unit_negotiate_protocol_picks_highest_shared_revision() {
        assert_eq!(negotiate_protocol(1, 3), Some(3));
        assert_eq!(negotiate_protocol(1, 2), Some(2));
        assert_eq!(negotiate_protocol(2, 99), Some(PROTOCOL_VERSION));
        assert_eq!(negotiate_protocol(99, 100), None);
    }

    #[test]
    fn unit_response_error_carries_code_and_field_path() {
        let frame = ServerFrame::response_error(
            "r1",
            &GatewayError::invalid_input("params.sessionKey", "must be a string"),
        );
        let rendered = serde_json::to_value(&frame).expect("serialize");
        assert_eq!(rendered["error"]["code"], json!("invalid-input"));
        assert_eq!(rendered["error"]["fieldPath"], json!("params.sessionKey"));
    }
}
