//! Gateway connection authorization.
//!
//! Four modes: `none` (loopback bypass only), `token` (timing-safe compare),
//! `password`, and `tailscale` (identity from proxy headers). Token mode
//! refuses non-loopback binds until a token is configured.

use std::collections::HashMap;
use std::net::SocketAddr;

use anyhow::{bail, Result};
use clawdis_config::{GatewayAuthMode, GatewayAuthSection};
use serde::Serialize;

use crate::gateway_protocol::AuthPayload;

const TAILSCALE_LOGIN_HEADER: &str = "tailscale-user-login";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "outcome")]
/// Enumerates supported `AuthOutcome` values.
pub enum AuthOutcome {
    Granted { identity: String },
    Denied { reason: String },
}

impl AuthOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted { .. })
    }
}

/// Constant-time byte comparison; never early-exits on mismatch.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (left, right) in a.iter().zip(b.iter()) {
        diff |= left ^ right;
    }
    diff == 0
}

/// Startup guard: token mode on a non-loopback bind requires a token.
pub fn validate_bind_auth(bind: &SocketAddr, auth: &GatewayAuthSection) -> Result<()> {
    let loopback = bind.ip().is_loopback();
    if auth.mode == GatewayAuthMode::Token
        && !loopback
        && auth
            .token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .is_none()
    {
        bail!(
            "gateway auth mode 'token' on non-loopback bind {} requires a configured token",
            bind
        );
    }
    Ok(())
}

/// Authorizes one connecting client.
pub fn authorize_client(
    auth: &GatewayAuthSection,
    provided: Option<&AuthPayload>,
    peer_is_loopback: bool,
    headers: &HashMap<String, String>,
) -> AuthOutcome {
    match auth.mode {
        GatewayAuthMode::None => {
            if peer_is_loopback {
                AuthOutcome::Granted {
                    identity: "loopback".to_string(),
                }
            } else {
                AuthOutcome::Denied {
                    reason: "auth mode none only admits loopback callers".to_string(),
                }
            }
        }
        GatewayAuthMode::Token => {
            let Some(expected) = auth
                .token
                .as_deref()
                .map(str::trim)
                .filter(|token| !token.is_empty())
            else {
                // No token configured: direct local callers may still pass.
                return if peer_is_loopback {
                    AuthOutcome::Granted {
                        identity: "loopback".to_string(),
                    }
                } else {
                    AuthOutcome::Denied {
                        reason: "no gateway token configured".to_string(),
                    }
                };
            };
            match provided.and_then(|payload| payload.token.as_deref()) {
                Some(token) if constant_time_eq(token, expected) => AuthOutcome::Granted {
                    identity: "token".to_string(),
                },
                Some(_) => AuthOutcome::Denied {
                    reason: "invalid token".to_string(),
                },
                None => AuthOutcome::Denied {
                    reason: "missing token".to_string(),
                },
            }
        }
        GatewayAuthMode::Password => {
            let Some(expected) = auth
                .password
                .as_deref()
                .filter(|password| !password.is_empty())
            else {
                return AuthOutcome::Denied {
                    reason: "no gateway password configured".to_string(),
                };
            };
            match provided.and_then(|payload| payload.password.as_deref()) {
                Some(password) if constant_time_eq(password, expected) => AuthOutcome::Granted {
                    identity: "password".to_string(),
                },
                Some(_) => AuthOutcome::Denied {
                    reason: "invalid password".to_string(),
                },
                None => AuthOutcome::Denied {
                    reason: "missing password".to_string(),
                },
            }
        }
        GatewayAuthMode::Tailscale => {
            match headers
                .get(TAILSCALE_LOGIN_HEADER)
                .map(String::as_str)
                .map(str::trim)
                .filter(|login| !login.is_empty())
            {
                Some(login) => AuthOutcome::Granted {
                    identity: format!("tailscale:{login}"),
                },
                None => AuthOutcome::Denied {
                    reason: "missing tailscale identity headers".to_string(),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use clawdis_config::{GatewayAuthMode, GatewayAuthSection};

    use super::{authorize_client, constant_time_eq, validate_bind_auth, AuthOutcome};
    use crate::gateway_protocol::AuthPayload;

    fn section(mode: GatewayAuthMode, token: Option<&str>, password: Option<&str>) -> GatewayAuthSection {
        GatewayAuthSection {
            mode,
            token: token.map(str::to_string),
            password: password.map(str::to_string),
        }
    }

    fn token_payload(token: &str) -> AuthPayload {
        AuthPayload {
            token: Some(token.to_string()),
            password: None,
        }
    }

    #[test]
    fn unit_constant_time_eq_matches_exactly() {
        assert!(constant_time_eq("secret", "secret"));
        assert!(!constant_time_eq("secret", "secres"));
        assert!(!constant_time_eq("secret", "secret2"));
        assert!(constant_time_eq("", ""));
    }

    #[test]
    fn functional_none_mode_bypasses_only_loopback() {
        let auth = section(GatewayAuthMode::None, None, None);
        assert!(authorize_client(&auth, None, true, &HashMap::new()).is_granted());
        assert!(!authorize_client(&auth, None, false, &HashMap::new()).is_granted());
    }

    #[test]
    fn functional_token_mode_requires_matching_token() {
        let auth = section(GatewayAuthMode::Token, Some("s3cret"), None);
        assert!(authorize_client(
            &auth,
            Some(&token_payload("s3cret")),
            false,
            &HashMap::new()
        )
        .is_granted());
        let denied = authorize_client(
            &auth,
            Some(&token_payload("wrong")),
            false,
            &HashMap::new(),
        );
        assert_eq!(
            denied,
            AuthOutcome::Denied {
                reason: "invalid token".to_string()
            }
        );
    }

    #[test]
    fn functional_tailscale_mode_reads_proxy_identity() {
        let auth = section(GatewayAuthMode::Tailscale, None, None);
        let mut headers = HashMap::new();
        headers.insert(
            "tailscale-user-login".to_string(),
            "owner@example.com".to_string(),
        );
        match authorize_client(&auth, None, false, &headers) {
            AuthOutcome::Granted { identity } => {
                assert_eq!(identity, "tailscale:owner@example.com");
            }
            denied => panic!("expected grant, got {denied:?}"),
        }
    }

    #[test]
    fn regression_token_mode_rejects_non_loopback_bind_without_token() {
        let auth = section(GatewayAuthMode::Token, None, None);
        let loopback: std::net::SocketAddr = "127.0.0.1:9630".parse().expect("addr");
        let public: std::net::SocketAddr = "0.0.0.0:9630".parse().expect("addr");
        validate_bind_auth(&loopback, &auth).expect("loopback bind is fine");
        let error = validate_bind_auth(&public, &auth).expect_err("public bind must fail");
        assert!(error.to_string().contains("requires a configured token"));
    }
}
