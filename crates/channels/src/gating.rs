//! Deciding whether an inbound message may trigger a generation.

use tether_config::{BotConfig, DmPolicy, MentionMode};

/// Check if an id matches an allowlist.
///
/// An empty allowlist means everyone is allowed (open policy).
/// Supports exact match and glob-style `*` wildcards.
pub fn is_allowed(id: &str, allowlist: &[String]) -> bool {
    allowlist.is_empty() || allowlist.iter().any(|pattern| glob_match(pattern.trim(), id))
}

/// Simple glob matching supporting `*` as a wildcard for any sequence of chars.
fn glob_match(pattern: &str, text: &str) -> bool {
    let Some((head, rest)) = pattern.split_once('*') else {
        return pattern == text;
    };
    let Some(mut remaining) = text.strip_prefix(head) else {
        return false;
    };

    let mut segments: Vec<&str> = rest.split('*').collect();
    let tail = segments.pop().unwrap_or_default();
    for segment in segments.into_iter().filter(|s| !s.is_empty()) {
        match remaining.find(segment) {
            Some(idx) => remaining = &remaining[idx + segment.len()..],
            None => return false,
        }
    }
    remaining.ends_with(tail)
}

/// What the platform adapter knows about an inbound message.
#[derive(Debug, Clone, Default)]
pub struct InboundContext<'a> {
    pub author_is_bot: bool,
    pub is_dm: bool,
    pub channel_id: &'a str,
    /// Parent channel when the message was posted in a thread.
    pub parent_channel_id: Option<&'a str>,
    pub author_role_ids: &'a [String],
    /// The bot was mentioned (guild messages).
    pub mentioned: bool,
}

/// Why an inbound message was ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Denied {
    BotAuthor,
    DmDisabled,
    NotMentioned,
    ChannelNotAllowed,
    RoleNotAllowed,
}

/// Apply the bot's access rules to one inbound message.
pub fn check_access(cfg: &BotConfig, msg: &InboundContext<'_>) -> Result<(), Denied> {
    if msg.author_is_bot {
        return Err(Denied::BotAuthor);
    }

    if msg.is_dm {
        if cfg.dm_policy == DmPolicy::Disabled {
            return Err(Denied::DmDisabled);
        }
        // DM authors carry no roles.
        if !cfg.allowed_role_ids.is_empty() {
            return Err(Denied::RoleNotAllowed);
        }
        return Ok(());
    }

    if cfg.mention_mode == MentionMode::Mention && !msg.mentioned {
        return Err(Denied::NotMentioned);
    }

    let channel_ok = is_allowed(msg.channel_id, &cfg.allowed_channel_ids)
        || msg
            .parent_channel_id
            .is_some_and(|parent| is_allowed(parent, &cfg.allowed_channel_ids));
    if !channel_ok {
        return Err(Denied::ChannelNotAllowed);
    }

    let role_ok = cfg.allowed_role_ids.is_empty()
        || msg
            .author_role_ids
            .iter()
            .any(|role| is_allowed(role, &cfg.allowed_role_ids));
    if !role_ok {
        return Err(Denied::RoleNotAllowed);
    }

    Ok(())
}
