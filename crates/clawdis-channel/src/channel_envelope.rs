//! Normalized inbound/outbound message records.
//!
//! Every surface lands on `ChannelEnvelope` before routing, policy, or
//! scheduling sees it. Invariants here keep the rest of the core free of
//! per-transport quirks.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `ChannelSurface` values.
pub enum ChannelSurface {
    Whatsapp,
    Telegram,
    Discord,
    Signal,
    Imessage,
    Slack,
    Webchat,
}

impl ChannelSurface {
    pub const ALL: [ChannelSurface; 7] = [
        Self::Whatsapp,
        Self::Telegram,
        Self::Discord,
        Self::Signal,
        Self::Imessage,
        Self::Slack,
        Self::Webchat,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Whatsapp => "whatsapp",
            Self::Telegram => "telegram",
            Self::Discord => "discord",
            Self::Signal => "signal",
            Self::Imessage => "imessage",
            Self::Slack => "slack",
            Self::Webchat => "webchat",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "whatsapp" => Some(Self::Whatsapp),
            "telegram" => Some(Self::Telegram),
            "discord" => Some(Self::Discord),
            "signal" => Some(Self::Signal),
            "imessage" => Some(Self::Imessage),
            "slack" => Some(Self::Slack),
            "webchat" => Some(Self::Webchat),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `ChatType` values.
pub enum ChatType {
    #[default]
    Direct,
    Group,
    Channel,
}

impl ChatType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Group => "group",
            Self::Channel => "channel",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
/// Inbound media attachment reference carried on an envelope.
pub struct EnvelopeMedia {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub mime: Option<String>,
    #[serde(default)]
    pub transcript: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
/// Public struct `ChannelEnvelope` used across Clawdis components.
pub struct ChannelEnvelope {
    pub surface: ChannelSurface,
    #[serde(default)]
    pub body: String,
    /// Body with leading directives (`/new`, `/thinking`, ...) stripped.
    #[serde(default)]
    pub command_body: String,
    #[serde(default)]
    pub reply_to_id: Option<String>,
    #[serde(default)]
    pub reply_to_body: Option<String>,
    #[serde(default)]
    pub reply_to_sender: Option<String>,
    pub from: String,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub chat_type: ChatType,
    #[serde(default)]
    pub group_subject: Option<String>,
    #[serde(default)]
    pub group_members: Vec<String>,
    #[serde(default)]
    pub room: Option<String>,
    #[serde(default)]
    pub space: Option<String>,
    #[serde(default)]
    pub sender_name: Option<String>,
    #[serde(default)]
    pub sender_identity: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub timestamp_ms: u64,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub media: Option<EnvelopeMedia>,
    #[serde(default)]
    pub was_mentioned: bool,
}

impl Default for ChannelSurface {
    fn default() -> Self {
        Self::Webchat
    }
}

impl ChannelEnvelope {
    pub fn new(surface: ChannelSurface, from: impl Into<String>, body: impl Into<String>) -> Self {
        let body = body.into();
        Self {
            surface,
            command_body: body.clone(),
            body,
            from: from.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.from.trim().is_empty() {
            bail!("envelope from cannot be empty");
        }
        if self.body.trim().is_empty() && self.media.is_none() {
            bail!("envelope must carry text or media");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
/// Public struct `OutboundPayload` used across Clawdis components.
pub struct OutboundPayload {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub media_url: Option<String>,
    #[serde(default)]
    pub media_urls: Vec<String>,
    #[serde(default)]
    pub reply_to_id: Option<String>,
    #[serde(default)]
    pub thread_id: Option<String>,
}

impl OutboundPayload {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    /// All media sources in order, regardless of which field carried them.
    pub fn all_media(&self) -> Vec<&str> {
        match &self.media_url {
            Some(single) => vec![single.as_str()],
            None => self.media_urls.iter().map(String::as_str).collect(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.media_url.is_some() && !self.media_urls.is_empty() {
            bail!("payload cannot set both media_url and media_urls");
        }
        if self.text.trim().is_empty() && self.all_media().is_empty() {
            bail!("payload with empty text requires media");
        }
        Ok(())
    }
}

/// Extracts `MEDIA:<path-or-url>` lines from agent output.
///
/// The hint must be the whole line with no whitespace after the prefix;
/// anything else is left in the text untouched.
pub fn extract_media_hints(text: &str) -> (String, Vec<String>) {
    let mut media = Vec::new();
    let mut kept = Vec::new();
    for line in text.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("MEDIA:") {
            if !rest.is_empty() && !rest.chars().any(char::is_whitespace) {
                media.push(rest.to_string());
                continue;
            }
        }
        kept.push(line);
    }
    (kept.join("\n").trim().to_string(), media)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Closed set of recognized `{{Placeholder}}` template keys.
pub enum TemplatePlaceholder {
    Body,
    CommandBody,
    SenderName,
    SenderIdentity,
    Surface,
    ChatType,
    GroupSubject,
    From,
}

impl TemplatePlaceholder {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "Body" => Some(Self::Body),
            "CommandBody" => Some(Self::CommandBody),
            "SenderName" => Some(Self::SenderName),
            "SenderIdentity" => Some(Self::SenderIdentity),
            "Surface" => Some(Self::Surface),
            "ChatType" => Some(Self::ChatType),
            "GroupSubject" => Some(Self::GroupSubject),
            "From" => Some(Self::From),
            _ => None,
        }
    }

    fn resolve(self, envelope: &ChannelEnvelope) -> String {
        match self {
            Self::Body => envelope.body.clone(),
            Self::CommandBody => envelope.command_body.clone(),
            Self::SenderName => envelope.sender_name.clone().unwrap_or_default(),
            Self::SenderIdentity => envelope.sender_identity.clone().unwrap_or_default(),
            Self::Surface => envelope.surface.as_str().to_string(),
            Self::ChatType => envelope.chat_type.as_str().to_string(),
            Self::GroupSubject => envelope.group_subject.clone().unwrap_or_default(),
            Self::From => envelope.from.clone(),
        }
    }
}

/// Pure `{{Placeholder}}` expansion; unknown keys resolve to empty.
pub fn expand_template(template: &str, envelope: &ChannelEnvelope) -> String {
    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find("{{") {
        rendered.push_str(&rest[..open]);
        let after_open = &rest[open + 2..];
        match after_open.find("}}") {
            Some(close) => {
                let key = after_open[..close].trim();
                if let Some(placeholder) = TemplatePlaceholder::parse(key) {
                    rendered.push_str(&placeholder.resolve(envelope));
                }
                rest = &after_open[close + 2..];
            }
            None => {
                rendered.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    rendered.push_str(rest);
    rendered
}
