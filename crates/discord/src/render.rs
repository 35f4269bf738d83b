//! How output messages look on Discord.

use {tether_channels::OutputState, tether_context::is_notice_line};

/// Appended to the embed body while a message is still streaming.
pub const STREAMING_INDICATOR: &str = " ⚪";

/// Appended to a plain message whose generation failed.
pub const ERROR_SUFFIX: &str = " ⚠️ error";

/// Discord's limit on an embed description.
pub const EMBED_DESCRIPTION_LIMIT: usize = 4096;

/// Discord's limit on plain message content.
pub const CONTENT_LIMIT: usize = 2000;

/// Shown instead of an empty body; Discord rejects empty messages.
const EMPTY_BODY: &str = "…";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Style {
    Embed,
    Plain,
}

impl Style {
    #[must_use]
    pub fn from_plain_flag(plain: bool) -> Self {
        if plain {
            Self::Plain
        } else {
            Self::Embed
        }
    }

    /// Body characters available to a message carrying `notices`.
    #[must_use]
    pub fn text_limit(self, notices: &[String]) -> usize {
        let limit = match self {
            Self::Embed => EMBED_DESCRIPTION_LIMIT - STREAMING_INDICATOR.chars().count(),
            Self::Plain => CONTENT_LIMIT
                .saturating_sub(plain_prefix(notices).chars().count())
                .saturating_sub(ERROR_SUFFIX.chars().count()),
        };
        limit.max(1)
    }
}

/// Embed colour per state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tone {
    Incomplete,
    Complete,
    Failed,
}

impl Tone {
    #[must_use]
    pub fn for_state(state: OutputState) -> Self {
        match state {
            OutputState::Streaming => Self::Incomplete,
            OutputState::Closed | OutputState::Done => Self::Complete,
            OutputState::Errored => Self::Failed,
        }
    }
}

/// Embed description for a body in `state`.
#[must_use]
pub fn embed_description(text: &str, state: OutputState) -> String {
    match state {
        OutputState::Streaming => format!("{text}{STREAMING_INDICATOR}"),
        _ if text.is_empty() => EMPTY_BODY.to_string(),
        _ => text.to_string(),
    }
}

/// Plain message content: notices first, then the body.
#[must_use]
pub fn plain_content(text: &str, notices: &[String], state: OutputState) -> String {
    let body = if text.is_empty() { EMPTY_BODY } else { text };
    let suffix = if state == OutputState::Errored {
        ERROR_SUFFIX
    } else {
        ""
    };
    format!("{}{body}{suffix}", plain_prefix(notices))
}

fn plain_prefix(notices: &[String]) -> String {
    notices.iter().map(|n| format!("{n}\n")).collect()
}

/// Recover the body of one of our own messages from its rendered form.
///
/// Plain messages may open with warning lines; those are dropped too.
#[must_use]
pub fn strip_rendering(rendered: &str) -> &str {
    let mut rendered = rendered;
    while let Some((line, rest)) = rendered.split_once('\n')
        && is_notice_line(line)
    {
        rendered = rest;
    }
    let body = rendered
        .strip_suffix(STREAMING_INDICATOR)
        .or_else(|| rendered.strip_suffix(ERROR_SUFFIX))
        .unwrap_or(rendered);
    if body == EMPTY_BODY { "" } else { body }
}
