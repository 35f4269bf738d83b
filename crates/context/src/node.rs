//! Raw platform messages and the resolved, immutable [`Node`]s built from them.

use std::collections::BTreeSet;

use {
    chrono::{DateTime, Utc},
    tether_common::{ChannelId, MessageId, UserId},
    tether_config::LimitsConfig,
};

// ── Platform input ──────────────────────────────────────────────────────────

/// Location of a message: platforms address messages per container.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageRef {
    pub channel_id: ChannelId,
    pub message_id: MessageId,
}

impl MessageRef {
    pub fn new(channel_id: impl Into<ChannelId>, message_id: impl Into<MessageId>) -> Self {
        Self {
            channel_id: channel_id.into(),
            message_id: message_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAttachment {
    pub url: String,
    pub filename: String,
    /// MIME type as reported by the platform, if any.
    pub content_type: Option<String>,
}

impl RawAttachment {
    fn mime(&self) -> &str {
        self.content_type.as_deref().unwrap_or_default()
    }

    #[must_use]
    pub fn is_text(&self) -> bool {
        self.mime().starts_with("text/")
    }

    #[must_use]
    pub fn is_image(&self) -> bool {
        self.mime().starts_with("image/")
    }

    /// MIME type without parameters (`text/plain; charset=utf-8` → `text/plain`).
    #[must_use]
    pub fn media_type(&self) -> &str {
        self.mime().split(';').next().unwrap_or_default().trim()
    }
}

/// A platform message as delivered by a [`crate::MessageSource`], before
/// extraction. Adapters strip bot mentions from `text` themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub author_id: UserId,
    pub is_self: bool,
    pub text: String,
    pub attachments: Vec<RawAttachment>,
    /// The message this one replies to, if any.
    pub parent: Option<MessageRef>,
    pub created_at: DateTime<Utc>,
}

// ── Warnings ────────────────────────────────────────────────────────────────

/// A recovered limit or fetch problem surfaced next to the reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Warning {
    MessageLimit,
    TextLimit,
    ImageLimit,
    UnsupportedAttachments,
    FetchFailed,
}

impl Warning {
    /// Stable machine-readable code.
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::MessageLimit => "message-limit-truncated",
            Self::TextLimit => "text-limit-truncated",
            Self::ImageLimit => "image-limit-truncated",
            Self::UnsupportedAttachments => "unsupported-attachments",
            Self::FetchFailed => "fetch-failed",
        }
    }

    /// User-facing line, with the configured limit filled in.
    #[must_use]
    pub fn user_text(self, limits: &LimitsConfig, vision: bool) -> String {
        match self {
            Self::MessageLimit => format!(
                "⚠️ Only using last {} message{}",
                limits.max_messages,
                plural(limits.max_messages)
            ),
            Self::TextLimit => format!("⚠️ Max {} characters per message", limits.max_text),
            Self::ImageLimit if !vision || limits.max_images == 0 => {
                "⚠️ Can't see images".to_string()
            },
            Self::ImageLimit => format!(
                "⚠️ Max {} image{} per message",
                limits.max_images,
                plural(limits.max_images)
            ),
            Self::UnsupportedAttachments => "⚠️ Unsupported attachments".to_string(),
            Self::FetchFailed => "⚠️ Couldn't fetch full conversation".to_string(),
        }
    }
}

/// Openings of every [`Warning::user_text`] line.
const NOTICE_OPENINGS: &[&str] = &[
    "⚠️ Only using last ",
    "⚠️ Max ",
    "⚠️ Can't see images",
    "⚠️ Unsupported attachments",
    "⚠️ Couldn't fetch full conversation",
];

/// Whether `line` is one of the warning lines shown to users.
#[must_use]
pub fn is_notice_line(line: &str) -> bool {
    NOTICE_OPENINGS.iter().any(|opening| line.starts_with(opening))
}

fn plural(n: usize) -> &'static str {
    if n == 1 { "" } else { "s" }
}

impl std::fmt::Display for Warning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

// ── Resolved nodes ──────────────────────────────────────────────────────────

/// Reference to an image attached to a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    /// Inline `data:` URL holding the downloaded image.
    pub url: String,
    pub media_type: String,
    /// Whether the active model can consume it.
    pub usable: bool,
}

/// One resolved chat message. Immutable once built; an edit produces a new
/// node after the cache entry is invalidated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub author_id: UserId,
    pub is_self: bool,
    pub text: String,
    pub images: Vec<ImageRef>,
    pub parent: Option<MessageRef>,
    pub created_at: DateTime<Utc>,
    /// Text or images were cut to fit the limits.
    pub truncated: bool,
    /// Attachments that are neither text nor images were skipped.
    pub unsupported_attachments: bool,
    /// Node-level warnings (text, image, attachment); never message-count.
    pub warnings: BTreeSet<Warning>,
}

impl Node {
    #[must_use]
    pub fn parent_id(&self) -> Option<&MessageId> {
        self.parent.as_ref().map(|p| &p.message_id)
    }

    /// Node for text this process produced itself (the bot's replies).
    pub fn own_output(
        id: MessageId,
        channel_id: ChannelId,
        author_id: UserId,
        text: impl Into<String>,
        parent: Option<MessageRef>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            channel_id,
            author_id,
            is_self: true,
            text: text.into(),
            images: Vec::new(),
            parent,
            created_at,
            truncated: false,
            unsupported_attachments: false,
            warnings: BTreeSet::new(),
        }
    }
}
