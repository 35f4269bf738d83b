//! Mapping resolved turns into provider chat messages.

use {
    chrono::{NaiveDate, Utc},
    tether_common::UserId,
    tether_providers::{ChatMessage, ContentPart},
};

use crate::resolver::{ResolvedConversation, Turn};

/// How authorship and images reach the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityPolicy {
    /// The backend accepts a per-message `name`.
    pub names: bool,
    /// The model accepts image inputs.
    pub vision: bool,
    /// Identity of the bot, used as the assistant name.
    pub bot_id: UserId,
}

/// Builds the chat-completions message list for one generation.
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    system_prompt: String,
}

impl RequestBuilder {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
        }
    }

    /// Build with today's (UTC) date in the system prompt.
    #[must_use]
    pub fn build(&self, resolved: &ResolvedConversation, policy: &IdentityPolicy) -> Vec<ChatMessage> {
        self.build_on(resolved, policy, Utc::now().date_naive())
    }

    #[must_use]
    pub fn build_on(
        &self,
        resolved: &ResolvedConversation,
        policy: &IdentityPolicy,
        today: NaiveDate,
    ) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(resolved.turns.len() + 1);
        if let Some(system) = self.system_message(policy, today) {
            messages.push(system);
        }
        messages.extend(
            resolved
                .turns
                .iter()
                .filter_map(|turn| turn_message(turn, policy)),
        );
        messages
    }

    fn system_message(&self, policy: &IdentityPolicy, today: NaiveDate) -> Option<ChatMessage> {
        let prompt = self.system_prompt.trim();
        if prompt.is_empty() {
            return None;
        }
        let mut lines = vec![
            prompt.to_string(),
            format!("Today's date: {}.", today.format("%B %d %Y")),
        ];
        if policy.names {
            lines.push(
                "User's names are their Discord IDs and should be typed as '<@ID>'.".to_string(),
            );
        }
        Some(ChatMessage::system(lines.join("\n")))
    }
}

/// One turn as a provider message; turns with nothing to say are skipped.
fn turn_message(turn: &Turn, policy: &IdentityPolicy) -> Option<ChatMessage> {
    if turn.is_self {
        if turn.text.is_empty() {
            return None;
        }
        let msg = ChatMessage::assistant(turn.text.clone());
        return Some(if policy.names {
            msg.with_name(policy.bot_id.as_str())
        } else {
            msg
        });
    }

    let text = if policy.names || turn.text.is_empty() {
        turn.text.clone()
    } else {
        format!("{}: {}", turn.author_id, turn.text)
    };

    let images: Vec<&str> = if policy.vision {
        turn.images
            .iter()
            .filter(|img| img.usable)
            .map(|img| img.url.as_str())
            .collect()
    } else {
        Vec::new()
    };

    let msg = match (text.is_empty(), images.is_empty()) {
        (true, true) => return None,
        (_, true) => ChatMessage::user(text),
        (_, false) => {
            let mut parts = Vec::with_capacity(images.len() + 1);
            if !text.is_empty() {
                parts.push(ContentPart::Text(text));
            }
            parts.extend(images.into_iter().map(|url| ContentPart::ImageUrl {
                url: url.to_string(),
            }));
            ChatMessage::user_multimodal(parts)
        },
    };

    Some(if policy.names {
        msg.with_name(turn.author_id.as_str())
    } else {
        msg
    })
}
