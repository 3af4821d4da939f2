//! Typed schema for `clawdis.json`.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use clawdis_core::write_json_atomic;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const CONFIG_SCHEMA_VERSION: u32 = 1;

fn config_schema_version() -> u32 {
    CONFIG_SCHEMA_VERSION
}

fn default_main_key() -> String {
    "main".to_string()
}

fn default_heartbeat_every() -> String {
    "0".to_string()
}

fn default_gateway_bind() -> String {
    "127.0.0.1:9630".to_string()
}

fn default_media_max_mb() -> u32 {
    5
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
/// Enumerates supported `QueueMode` values.
pub enum QueueMode {
    Interrupt,
    Steer,
    #[default]
    Followup,
    Collect,
    BacklogInterrupt,
    BacklogSteer,
    BacklogFollowup,
    BacklogCollect,
}

impl QueueMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Interrupt => "interrupt",
            Self::Steer => "steer",
            Self::Followup => "followup",
            Self::Collect => "collect",
            Self::BacklogInterrupt => "backlog-interrupt",
            Self::BacklogSteer => "backlog-steer",
            Self::BacklogFollowup => "backlog-followup",
            Self::BacklogCollect => "backlog-collect",
        }
    }

    /// Backlog variants replay disconnected-arrival envelopes before new work.
    pub fn is_backlog(self) -> bool {
        matches!(
            self,
            Self::BacklogInterrupt
                | Self::BacklogSteer
                | Self::BacklogFollowup
                | Self::BacklogCollect
        )
    }

    /// The non-backlog behavior this mode applies to an in-flight run.
    pub fn base_mode(self) -> QueueMode {
        match self {
            Self::BacklogInterrupt => Self::Interrupt,
            Self::BacklogSteer => Self::Steer,
            Self::BacklogFollowup => Self::Followup,
            Self::BacklogCollect => Self::Collect,
            other => other,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
/// Enumerates supported `SessionScope` values.
pub enum SessionScope {
    #[default]
    PerSender,
    Global,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `DmPolicy` values.
pub enum DmPolicy {
    Open,
    #[default]
    Pairing,
    Allowlist,
}

impl DmPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Pairing => "pairing",
            Self::Allowlist => "allowlist",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `GroupPolicy` values.
pub enum GroupPolicy {
    #[default]
    Open,
    Disabled,
    Allowlist,
}

impl GroupPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Disabled => "disabled",
            Self::Allowlist => "allowlist",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
/// Per-group override rules, keyed by group id (`"*"` is the wildcard).
pub struct GroupRule {
    #[serde(default, rename = "requireMention")]
    pub require_mention: bool,
    #[serde(default)]
    pub allow: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Public struct `ChannelSection` used across Clawdis components.
pub struct ChannelSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, rename = "allowFrom")]
    pub allow_from: Vec<String>,
    #[serde(default, rename = "dmPolicy")]
    pub dm_policy: DmPolicy,
    #[serde(default, rename = "groupPolicy")]
    pub group_policy: GroupPolicy,
    #[serde(default, rename = "groupAllowlist")]
    pub group_allowlist: Vec<String>,
    #[serde(default)]
    pub groups: BTreeMap<String, GroupRule>,
    #[serde(default, rename = "mentionPatterns")]
    pub mention_patterns: Option<Vec<String>>,
    #[serde(default = "default_media_max_mb", rename = "mediaMaxMb")]
    pub media_max_mb: u32,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Default for ChannelSection {
    fn default() -> Self {
        Self {
            enabled: false,
            allow_from: Vec::new(),
            dm_policy: DmPolicy::default(),
            group_policy: GroupPolicy::default(),
            group_allowlist: Vec::new(),
            groups: BTreeMap::new(),
            mention_patterns: None,
            media_max_mb: default_media_max_mb(),
            extra: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `HeartbeatTarget` values.
pub enum HeartbeatTarget {
    #[default]
    None,
    Last,
    Whatsapp,
    Telegram,
    Discord,
    Signal,
    Imessage,
    Slack,
}

impl HeartbeatTarget {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Last => "last",
            Self::Whatsapp => "whatsapp",
            Self::Telegram => "telegram",
            Self::Discord => "discord",
            Self::Signal => "signal",
            Self::Imessage => "imessage",
            Self::Slack => "slack",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Public struct `HeartbeatSection` used across Clawdis components.
pub struct HeartbeatSection {
    #[serde(default = "default_heartbeat_every")]
    pub every: String,
    #[serde(default)]
    pub target: HeartbeatTarget,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
}

impl Default for HeartbeatSection {
    fn default() -> Self {
        Self {
            every: default_heartbeat_every(),
            target: HeartbeatTarget::default(),
            to: None,
            prompt: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
/// Public struct `AgentSection` used across Clawdis components.
pub struct AgentSection {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub heartbeat: HeartbeatSection,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
/// Public struct `QueueSection` used across Clawdis components.
pub struct QueueSection {
    #[serde(default)]
    pub mode: QueueMode,
    #[serde(default, rename = "byChannel")]
    pub by_channel: BTreeMap<String, QueueMode>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
/// Public struct `MessagesSection` used across Clawdis components.
pub struct MessagesSection {
    #[serde(default)]
    pub queue: QueueSection,
    #[serde(default, rename = "mentionPatterns")]
    pub mention_patterns: Vec<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Public struct `SessionSection` used across Clawdis components.
pub struct SessionSection {
    #[serde(default)]
    pub scope: SessionScope,
    #[serde(default = "default_main_key", rename = "mainKey")]
    pub main_key: String,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            scope: SessionScope::default(),
            main_key: default_main_key(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `GatewayAuthMode` values.
pub enum GatewayAuthMode {
    #[default]
    None,
    Token,
    Password,
    Tailscale,
}

impl GatewayAuthMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Token => "token",
            Self::Password => "password",
            Self::Tailscale => "tailscale",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
/// Public struct `GatewayAuthSection` used across Clawdis components.
pub struct GatewayAuthSection {
    #[serde(default)]
    pub mode: GatewayAuthMode,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Public struct `GatewaySection` used across Clawdis components.
pub struct GatewaySection {
    #[serde(default = "default_gateway_bind")]
    pub bind: String,
    #[serde(default)]
    pub auth: GatewayAuthSection,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            bind: default_gateway_bind(),
            auth: GatewayAuthSection::default(),
            extra: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Root of `clawdis.json`. Unknown roots survive round-trips via `extra`.
pub struct ClawdisConfig {
    #[serde(default = "config_schema_version", rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub channels: BTreeMap<String, ChannelSection>,
    #[serde(default)]
    pub messages: MessagesSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Default for ClawdisConfig {
    fn default() -> Self {
        Self {
            schema_version: CONFIG_SCHEMA_VERSION,
            agent: AgentSection::default(),
            channels: BTreeMap::new(),
            messages: MessagesSection::default(),
            session: SessionSection::default(),
            gateway: GatewaySection::default(),
            extra: BTreeMap::new(),
        }
    }
}

impl ClawdisConfig {
    pub fn channel(&self, channel_id: &str) -> ChannelSection {
        self.channels.get(channel_id).cloned().unwrap_or_default()
    }

    /// Effective queue mode for one channel, honoring the per-channel override.
    ///
    /// The override wins verbatim, including its backlog-ness; no merging with
    /// the global mode happens.
    pub fn queue_mode_for_channel(&self, channel_id: &str) -> QueueMode {
        self.messages
            .queue
            .by_channel
            .get(channel_id)
            .copied()
            .unwrap_or(self.messages.queue.mode)
    }

    pub fn mention_patterns_for_channel(&self, channel_id: &str) -> Vec<String> {
        if let Some(section) = self.channels.get(channel_id) {
            if let Some(patterns) = &section.mention_patterns {
                return patterns.clone();
            }
        }
        self.messages.mention_patterns.clone()
    }
}

pub fn parse_config(raw: &str) -> Result<ClawdisConfig> {
    let parsed =
        serde_json::from_str::<ClawdisConfig>(raw).context("failed to parse clawdis.json")?;
    validate_config(&parsed)?;
    Ok(parsed)
}

pub fn load_config(path: &Path) -> Result<ClawdisConfig> {
    if !path.exists() {
        return Ok(ClawdisConfig::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    parse_config(&raw).with_context(|| format!("invalid config {}", path.display()))
}

pub fn save_config(path: &Path, config: &ClawdisConfig) -> Result<()> {
    validate_config(config)?;
    write_json_atomic(path, config).context("failed to save clawdis.json")
}

fn validate_config(config: &ClawdisConfig) -> Result<()> {
    if config.schema_version != CONFIG_SCHEMA_VERSION {
        bail!(
            "unsupported config schemaVersion {} (expected {})",
            config.schema_version,
            CONFIG_SCHEMA_VERSION
        );
    }
    if config.session.main_key.trim().is_empty() {
        bail!("session.mainKey cannot be empty");
    }
    for key in config.channels.keys() {
        if key.trim().is_empty() {
            bail!("channels key must not be empty");
        }
    }
    Ok(())
}
