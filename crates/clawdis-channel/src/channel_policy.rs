//! Inbound allow/policy gate.
//!
//! Evaluates DM allowlists, group policy, and mention gating before an
//! envelope may start or join a run. Denials carry stable reason codes; a
//! mention-gated group message is stored as context but never dispatched.

use clawdis_config::{ChannelSection, DmPolicy, GroupPolicy};
use serde::Serialize;

use crate::channel_envelope::{ChannelEnvelope, ChatType};

pub const WILDCARD_ALLOW: &str = "*";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "decision")]
/// Enumerates supported `PolicyDecision` values.
pub enum PolicyDecision {
    Allow {
        reason_code: String,
    },
    /// Denied outright; the envelope is dropped.
    Deny {
        reason_code: String,
    },
    /// Denied for dispatch but retained as conversation context.
    DenyStoreContext {
        reason_code: String,
    },
    /// Unknown direct sender on a pairing-policy channel; the caller should
    /// mint a pairing request for the peer.
    PairingRequired {
        reason_code: String,
    },
}

impl PolicyDecision {
    pub fn allows_dispatch(&self) -> bool {
        matches!(self, Self::Allow { .. })
    }

    pub fn reason_code(&self) -> &str {
        match self {
            Self::Allow { reason_code }
            | Self::Deny { reason_code }
            | Self::DenyStoreContext { reason_code }
            | Self::PairingRequired { reason_code } => reason_code,
        }
    }
}

fn allow(reason_code: &str) -> PolicyDecision {
    PolicyDecision::Allow {
        reason_code: reason_code.to_string(),
    }
}

fn deny(reason_code: &str) -> PolicyDecision {
    PolicyDecision::Deny {
        reason_code: reason_code.to_string(),
    }
}

/// Whether `sender` is admitted by an allowlist. `["*"]` admits any sender;
/// an empty list admits none.
pub fn allowlist_admits(allow_from: &[String], sender: &str) -> bool {
    let sender = sender.trim();
    allow_from
        .iter()
        .map(|entry| entry.trim())
        .any(|entry| entry == WILDCARD_ALLOW || (!entry.is_empty() && entry == sender))
}

fn mention_present(envelope: &ChannelEnvelope, mention_patterns: &[String]) -> bool {
    if envelope.was_mentioned {
        return true;
    }
    let body = envelope.body.to_ascii_lowercase();
    mention_patterns
        .iter()
        .map(|pattern| pattern.trim().to_ascii_lowercase())
        .any(|pattern| !pattern.is_empty() && body.contains(&pattern))
}

fn group_rule_requires_mention(section: &ChannelSection, group_id: &str) -> bool {
    if let Some(rule) = section.groups.get(group_id) {
        return rule.require_mention;
    }
    section
        .groups
        .get(WILDCARD_ALLOW)
        .map(|rule| rule.require_mention)
        .unwrap_or(false)
}

fn group_rule_allows(section: &ChannelSection, group_id: &str) -> Option<bool> {
    section
        .groups
        .get(group_id)
        .or_else(|| section.groups.get(WILDCARD_ALLOW))
        .and_then(|rule| rule.allow)
}

/// Gates one inbound envelope against channel policy.
pub fn evaluate_inbound_policy(
    section: &ChannelSection,
    mention_patterns: &[String],
    envelope: &ChannelEnvelope,
) -> PolicyDecision {
    match envelope.chat_type {
        ChatType::Direct => evaluate_direct(section, envelope),
        ChatType::Group | ChatType::Channel => {
            evaluate_group(section, mention_patterns, envelope)
        }
    }
}

fn evaluate_direct(section: &ChannelSection, envelope: &ChannelEnvelope) -> PolicyDecision {
    match section.dm_policy {
        DmPolicy::Open => allow("dm_policy_open"),
        DmPolicy::Allowlist => {
            if allowlist_admits(&section.allow_from, &envelope.from) {
                allow("dm_allowlisted")
            } else {
                deny("dm_not_allowlisted")
            }
        }
        DmPolicy::Pairing => {
            if allowlist_admits(&section.allow_from, &envelope.from) {
                allow("dm_allowlisted")
            } else {
                PolicyDecision::PairingRequired {
                    reason_code: "dm_pairing_required".to_string(),
                }
            }
        }
    }
}

fn evaluate_group(
    section: &ChannelSection,
    mention_patterns: &[String],
    envelope: &ChannelEnvelope,
) -> PolicyDecision {
    let group_id = envelope.from.trim();
    match section.group_policy {
        GroupPolicy::Disabled => return deny("group_policy_disabled"),
        GroupPolicy::Allowlist => {
            let admitted = allowlist_admits(&section.group_allowlist, group_id)
                || group_rule_allows(section, group_id) == Some(true);
            if !admitted {
                return deny("group_not_allowlisted");
            }
        }
        GroupPolicy::Open => {
            if group_rule_allows(section, group_id) == Some(false) {
                return deny("group_rule_denied");
            }
        }
    }

    if group_rule_requires_mention(section, group_id)
        && !mention_present(envelope, mention_patterns)
    {
        return PolicyDecision::DenyStoreContext {
            reason_code: "group_mention_required".to_string(),
        };
    }

    allow("group_admitted")
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use clawdis_config::{ChannelSection, DmPolicy, GroupPolicy, GroupRule};

    use super::{allowlist_admits, evaluate_inbound_policy, PolicyDecision};
    use crate::channel_envelope::{ChannelEnvelope, ChannelSurface, ChatType};

    fn group_envelope(body: &str) -> ChannelEnvelope {
        ChannelEnvelope {
            chat_type: ChatType::Group,
            ..ChannelEnvelope::new(ChannelSurface::Whatsapp, "123@g.us", body)
        }
    }

    fn mention_gated_section() -> ChannelSection {
        ChannelSection {
            enabled: true,
            groups: BTreeMap::from([(
                "*".to_string(),
                GroupRule {
                    require_mention: true,
                    allow: None,
                },
            )]),
            ..ChannelSection::default()
        }
    }

    #[test]
    fn unit_wildcard_allowlist_admits_any_sender_and_empty_admits_none() {
        assert!(allowlist_admits(&["*".to_string()], "+15550001111"));
        assert!(!allowlist_admits(&[], "+15550001111"));
        assert!(allowlist_admits(
            &["+15555550123".to_string()],
            "+15555550123"
        ));
        assert!(!allowlist_admits(&["+15555550123".to_string()], "+15550009"));
    }

    #[test]
    fn functional_group_mention_gate_dispatches_only_on_mention() {
        let section = mention_gated_section();
        let patterns = vec!["@clawd".to_string()];

        let mentioned = evaluate_inbound_policy(&section, &patterns, &group_envelope("@clawd status"));
        assert!(mentioned.allows_dispatch());

        let silent = evaluate_inbound_policy(&section, &patterns, &group_envelope("hello"));
        assert_eq!(
            silent,
            PolicyDecision::DenyStoreContext {
                reason_code: "group_mention_required".to_string(),
            }
        );
    }

    #[test]
    fn functional_pairing_policy_requests_pairing_for_unknown_sender() {
        let section = ChannelSection {
            dm_policy: DmPolicy::Pairing,
            allow_from: vec!["+15555550123".to_string()],
            ..ChannelSection::default()
        };
        let known = ChannelEnvelope::new(ChannelSurface::Whatsapp, "+15555550123", "hi");
        assert!(evaluate_inbound_policy(&section, &[], &known).allows_dispatch());

        let unknown = ChannelEnvelope::new(ChannelSurface::Whatsapp, "+15550009999", "hi");
        assert_eq!(
            evaluate_inbound_policy(&section, &[], &unknown),
            PolicyDecision::PairingRequired {
                reason_code: "dm_pairing_required".to_string(),
            }
        );
    }

    #[test]
    fn regression_empty_group_allowlist_admits_no_group() {
        let section = ChannelSection {
            group_policy: GroupPolicy::Allowlist,
            group_allowlist: Vec::new(),
            ..ChannelSection::default()
        };
        let decision = evaluate_inbound_policy(&section, &[], &group_envelope("@clawd hi"));
        assert_eq!(decision.reason_code(), "group_not_allowlisted");
    }

    #[test]
    fn regression_disabled_group_policy_beats_mention() {
        let section = ChannelSection {
            group_policy: GroupPolicy::Disabled,
            ..mention_gated_section()
        };
        let decision =
            evaluate_inbound_policy(&section, &["@clawd".to_string()], &group_envelope("@clawd hi"));
        assert_eq!(decision.reason_code(), "group_policy_disabled");
    }
}
