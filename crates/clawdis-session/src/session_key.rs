//! Deterministic envelope → session key mapping.
//!
//! Direct chats collapse onto the shared main key; groups and channels get
//! per-conversation keys so the scheduler serializes them independently.

use clawdis_channel::{ChannelEnvelope, ChannelSurface, ChatType};
use clawdis_config::SessionScope;

pub const GLOBAL_SESSION_KEY: &str = "global";

/// Resolves the scheduler key for one inbound envelope.
pub fn resolve_session_key(
    envelope: &ChannelEnvelope,
    scope: SessionScope,
    main_key: &str,
) -> String {
    if scope == SessionScope::Global {
        return GLOBAL_SESSION_KEY.to_string();
    }

    let surface = envelope.surface.as_str();
    if is_group_envelope(envelope) {
        let id = strip_group_prefixes(&envelope.from, surface);
        let mut key = format!("{surface}:group:{id}");
        if envelope.surface == ChannelSurface::Telegram {
            if let Some(thread) = envelope
                .thread_id
                .as_deref()
                .map(str::trim)
                .filter(|thread| !thread.is_empty())
            {
                key.push_str(":topic:");
                key.push_str(thread);
            }
        }
        return key;
    }

    if envelope.chat_type == ChatType::Channel {
        let id = strip_group_prefixes(&envelope.from, surface);
        return format!("{surface}:channel:{id}");
    }

    main_key.to_string()
}

fn is_group_envelope(envelope: &ChannelEnvelope) -> bool {
    if envelope.chat_type == ChatType::Group {
        return true;
    }
    let from = envelope.from.trim();
    if from.starts_with("group:") {
        return true;
    }
    // Surface-specific group tags survive even when normalization missed the
    // chat type.
    match envelope.surface {
        ChannelSurface::Whatsapp => from.ends_with("@g.us"),
        _ => false,
    }
}

fn strip_group_prefixes(from: &str, surface: &str) -> String {
    let mut id = from.trim();
    if let Some(stripped) = id.strip_prefix("group:") {
        id = stripped;
    }
    let surface_prefix = format!("{surface}:");
    if let Some(stripped) = id.strip_prefix(&surface_prefix) {
        id = stripped;
    }
    if let Some(stripped) = id.strip_prefix("group:") {
        id = stripped;
    }
    id.to_string()
}

/// Human label for a group session: the subject when known, otherwise a
/// surface-qualified slug.
pub fn group_display_name(envelope: &ChannelEnvelope) -> String {
    if let Some(subject) = envelope
        .group_subject
        .as_deref()
        .map(str::trim)
        .filter(|subject| !subject.is_empty())
    {
        return subject.to_string();
    }

    let surface = envelope.surface.as_str();
    let slug = match envelope.surface {
        ChannelSurface::Discord => {
            let space = envelope.space.as_deref().unwrap_or_default();
            let room = envelope.room.as_deref().unwrap_or_default();
            normalize_slug(&format!("{space} {room}"))
        }
        _ => match envelope.room.as_deref().filter(|room| !room.is_empty()) {
            Some(room) => format!("#{}", normalize_slug(room)),
            None => format!(
                "g-{}",
                normalize_slug(&strip_group_prefixes(&envelope.from, surface))
            ),
        },
    };
    format!("{surface}:{slug}")
}

/// Lowercases, maps spaces to `-`, and keeps only `#@+._-` plus
/// alphanumerics.
fn normalize_slug(raw: &str) -> String {
    raw.trim()
        .to_lowercase()
        .chars()
        .filter_map(|ch| {
            if ch.is_whitespace() {
                Some('-')
            } else if ch.is_alphanumeric() || matches!(ch, '#' | '@' | '+' | '.' | '_' | '-') {
                Some(ch)
            } else {
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use clawdis_channel::{ChannelEnvelope, ChannelSurface, ChatType};
    use clawdis_config::SessionScope;

    use super::{group_display_name, resolve_session_key, GLOBAL_SESSION_KEY};

    fn direct(surface: ChannelSurface, from: &str) -> ChannelEnvelope {
        ChannelEnvelope::new(surface, from, "hi")
    }

    #[test]
    fn unit_direct_chats_collapse_to_main_key() {
        let envelope = direct(ChannelSurface::Whatsapp, "+15555550123");
        assert_eq!(
            resolve_session_key(&envelope, SessionScope::PerSender, "main"),
            "main"
        );
    }

    #[test]
    fn unit_global_scope_short_circuits_everything() {
        let mut envelope = direct(ChannelSurface::Telegram, "42");
        envelope.chat_type = ChatType::Group;
        assert_eq!(
            resolve_session_key(&envelope, SessionScope::Global, "main"),
            GLOBAL_SESSION_KEY
        );
    }

    #[test]
    fn functional_group_keys_carry_surface_prefix() {
        let mut envelope = direct(ChannelSurface::Whatsapp, "123@g.us");
        envelope.chat_type = ChatType::Group;
        assert_eq!(
            resolve_session_key(&envelope, SessionScope::PerSender, "main"),
            "whatsapp:group:123@g.us"
        );
    }

    #[test]
    fn functional_group_tag_detection_works_without_chat_type() {
        let envelope = direct(ChannelSurface::Whatsapp, "123@g.us");
        assert_eq!(
            resolve_session_key(&envelope, SessionScope::PerSender, "main"),
            "whatsapp:group:123@g.us"
        );

        let prefixed = direct(ChannelSurface::Discord, "group:ops-room");
        assert_eq!(
            resolve_session_key(&prefixed, SessionScope::PerSender, "main"),
            "discord:group:ops-room"
        );
    }

    #[test]
    fn functional_telegram_forum_topic_appends_thread_suffix() {
        let mut envelope = direct(ChannelSurface::Telegram, "-1001234");
        envelope.chat_type = ChatType::Group;
        envelope.thread_id = Some("77".to_string());
        assert_eq!(
            resolve_session_key(&envelope, SessionScope::PerSender, "main"),
            "telegram:group:-1001234:topic:77"
        );
    }

    #[test]
    fn functional_channel_chats_use_channel_shape() {
        let mut envelope = direct(ChannelSurface::Slack, "C024BE91L");
        envelope.chat_type = ChatType::Channel;
        assert_eq!(
            resolve_session_key(&envelope, SessionScope::PerSender, "main"),
            "slack:channel:C024BE91L"
        );
    }

    #[test]
    fn regression_double_prefixes_are_stripped_once_each() {
        let envelope = direct(ChannelSurface::Telegram, "group:telegram:-100999");
        assert_eq!(
            resolve_session_key(&envelope, SessionScope::PerSender, "main"),
            "telegram:group:-100999"
        );
    }

    #[test]
    fn unit_display_name_prefers_subject_then_slug() {
        let mut envelope = direct(ChannelSurface::Whatsapp, "123@g.us");
        envelope.chat_type = ChatType::Group;
        envelope.group_subject = Some("Family Chat".to_string());
        assert_eq!(group_display_name(&envelope), "Family Chat");

        envelope.group_subject = None;
        assert_eq!(group_display_name(&envelope), "whatsapp:g-123@g.us");
    }

    #[test]
    fn unit_display_name_for_rooms_and_discord_combines_parts() {
        let mut room = direct(ChannelSurface::Slack, "C123");
        room.chat_type = ChatType::Channel;
        room.room = Some("Ops Alerts".to_string());
        assert_eq!(group_display_name(&room), "slack:#ops-alerts");

        let mut discord = direct(ChannelSurface::Discord, "555");
        discord.chat_type = ChatType::Group;
        discord.space = Some("My Guild".to_string());
        discord.room = Some("general".to_string());
        assert_eq!(group_display_name(&discord), "discord:my-guild-general");
    }
}
