//! `clawdis://` deep links.
//!
//! `clawdis://agent?message=…&sessionKey=…&deliver=…&to=…&channel=…` runs an
//! agent turn. Links without `key` require an interactive confirm; a valid
//! `key` (the gateway token) runs unattended.

use anyhow::{bail, Result};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
/// Parsed `clawdis://agent` request.
pub struct AgentDeepLink {
    pub message: String,
    pub session_key: Option<String>,
    pub thinking: Option<String>,
    pub deliver: bool,
    pub to: Option<String>,
    pub channel: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub key: Option<String>,
}

pub fn parse_agent_deep_link(url: &str) -> Result<AgentDeepLink> {
    let rest = url
        .strip_prefix("clawdis://")
        .ok_or_else(|| anyhow::anyhow!("deep link must start with clawdis://"))?;
    let (host, query) = match rest.split_once('?') {
        Some((host, query)) => (host, query),
        None => (rest, ""),
    };
    if host != "agent" {
        bail!("unsupported deep link host '{host}'");
    }

    let mut link = AgentDeepLink::default();
    for pair in query.split('&').filter(|pair| !pair.is_empty()) {
        let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
        let value = percent_decode(value);
        match name {
            "message" => link.message = value,
            "sessionKey" => link.session_key = non_empty(value),
            "thinking" => link.thinking = non_empty(value),
            "deliver" => link.deliver = matches!(value.as_str(), "1" | "true" | "yes"),
            "to" => link.to = non_empty(value),
            "channel" => link.channel = non_empty(value),
            "timeoutSeconds" => link.timeout_seconds = value.parse::<u64>().ok(),
            "key" => link.key = non_empty(value),
            other => {
                // Unknown params are ignored so older links keep working.
                tracing::debug!(target: "clawdis.cli", param = other, "ignoring deep link param");
            }
        }
    }

    if link.message.trim().is_empty() {
        bail!("deep link requires a non-empty message parameter");
    }
    Ok(link)
}

fn non_empty(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

fn percent_decode(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        match bytes[index] {
            b'%' => {
                let hex = bytes.get(index + 1..index + 3);
                match hex.and_then(|hex| {
                    std::str::from_utf8(hex)
                        .ok()
                        .and_then(|hex| u8::from_str_radix(hex, 16).ok())
                }) {
                    Some(byte) => {
                        decoded.push(byte);
                        index += 3;
                    }
                    None => {
                        decoded.push(b'%');
                        index += 1;
                    }
                }
            }
            b'+' => {
                decoded.push(b' ');
                index += 1;
            }
            byte => {
                decoded.push(byte);
                index += 1;
            }
        }
    }
    String::from_utf8_lossy(&decoded).into_owned()
}

#[cfg(test)]
mod tests {
    use super::{parse_agent_deep_link, percent_decode};

    #[test]
    fn unit_percent_decode_handles_escapes_and_plus() {
        assert_eq!(percent_decode("hello%20world"), "hello world");
        assert_eq!(percent_decode("a+b"), "a b");
        assert_eq!(percent_decode("100%"), "100%");
        assert_eq!(percent_decode("%2Fpath"), "/path");
    }

    #[test]
    fn functional_full_agent_link_parses_every_field() {
        let link = parse_agent_deep_link(
            "clawdis://agent?message=check%20the%20build&sessionKey=main&thinking=high&deliver=true&to=%2B15555550123&channel=whatsapp&timeoutSeconds=30&key=ABCD2345",
        )
        .expect("parse");
        assert_eq!(link.message, "check the build");
        assert_eq!(link.session_key.as_deref(), Some("main"));
        assert_eq!(link.thinking.as_deref(), Some("high"));
        assert!(link.deliver);
        assert_eq!(link.to.as_deref(), Some("+15555550123"));
        assert_eq!(link.channel.as_deref(), Some("whatsapp"));
        assert_eq!(link.timeout_seconds, Some(30));
        assert_eq!(link.key.as_deref(), Some("ABCD2345"));
    }

    #[test]
    fn regression_missing_message_or_wrong_host_fails() {
        assert!(parse_agent_deep_link("clawdis://agent?deliver=true").is_err());
        assert!(parse_agent_deep_link("clawdis://other?message=x").is_err());
        assert!(parse_agent_deep_link("https://agent?message=x").is_err());
    }
}
