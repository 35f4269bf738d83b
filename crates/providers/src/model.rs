use std::pin::Pin;

use tokio_stream::Stream;

// ── Typed chat messages ─────────────────────────────────────────────────────

/// Typed chat message for the LLM provider interface.
///
/// `name` carries the author identity for backends that accept named
/// participants; backends that don't get the identity inlined into the text
/// instead, so the field is simply `None` there.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatMessage {
    System {
        content: String,
    },
    User {
        content: UserContent,
        name: Option<String>,
    },
    Assistant {
        content: String,
        name: Option<String>,
    },
}

/// User message content: plain text or multimodal (text + images).
#[derive(Debug, Clone, PartialEq)]
pub enum UserContent {
    Text(String),
    Multimodal(Vec<ContentPart>),
}

/// A single part of a multimodal content array.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentPart {
    Text(String),
    ImageUrl { url: String },
}

impl ChatMessage {
    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::System {
            content: content.into(),
        }
    }

    /// Create a user message with plain text.
    pub fn user(content: impl Into<String>) -> Self {
        Self::User {
            content: UserContent::Text(content.into()),
            name: None,
        }
    }

    /// Create a user message with multimodal content.
    pub fn user_multimodal(parts: Vec<ContentPart>) -> Self {
        Self::User {
            content: UserContent::Multimodal(parts),
            name: None,
        }
    }

    /// Create an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::Assistant {
            content: content.into(),
            name: None,
        }
    }

    /// Attach an author name. System messages are left untouched.
    #[must_use]
    pub fn with_name(mut self, author: impl Into<String>) -> Self {
        match &mut self {
            Self::User { name, .. } | Self::Assistant { name, .. } => *name = Some(author.into()),
            Self::System { .. } => {},
        }
        self
    }

    #[must_use]
    pub fn role(&self) -> &'static str {
        match self {
            Self::System { .. } => "system",
            Self::User { .. } => "user",
            Self::Assistant { .. } => "assistant",
        }
    }

    /// Convert to OpenAI-compatible JSON format.
    #[must_use]
    pub fn to_openai_value(&self) -> serde_json::Value {
        let mut value = match self {
            ChatMessage::System { content } => {
                serde_json::json!({ "role": "system", "content": content })
            },
            ChatMessage::User { content, .. } => match content {
                UserContent::Text(text) => {
                    serde_json::json!({ "role": "user", "content": text })
                },
                UserContent::Multimodal(parts) => {
                    let blocks: Vec<serde_json::Value> = parts
                        .iter()
                        .map(|part| match part {
                            ContentPart::Text(text) => {
                                serde_json::json!({ "type": "text", "text": text })
                            },
                            ContentPart::ImageUrl { url } => serde_json::json!({
                                "type": "image_url",
                                "image_url": { "url": url }
                            }),
                        })
                        .collect();
                    serde_json::json!({ "role": "user", "content": blocks })
                },
            },
            ChatMessage::Assistant { content, .. } => {
                serde_json::json!({ "role": "assistant", "content": content })
            },
        };

        if let ChatMessage::User {
            name: Some(name), ..
        }
        | ChatMessage::Assistant {
            name: Some(name), ..
        } = self
        {
            value["name"] = serde_json::Value::String(name.clone());
        }
        value
    }
}

// ── Stream events ───────────────────────────────────────────────────────────

/// Events emitted during streaming LLM completion.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Text content delta.
    Delta(String),
    /// Stream completed successfully.
    Done(Usage),
    /// An error occurred; no further events follow.
    Error(String),
}

/// Token usage reported by the backend, when it reports any.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// A boxed, finite stream of completion events.
pub type EventStream<'a> = Pin<Box<dyn Stream<Item = StreamEvent> + Send + 'a>>;

/// LLM provider trait.
pub trait LlmProvider: Send + Sync {
    /// Provider name from the config (e.g. "openai", "ollama").
    fn name(&self) -> &str;

    /// Model identifier (e.g. "gpt-4o").
    fn id(&self) -> &str;

    /// Stream a completion, yielding delta/done/error events.
    ///
    /// The stream is not restartable; dropping it aborts the request.
    fn stream(&self, messages: Vec<ChatMessage>) -> EventStream<'_>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_text_serializes_with_name() {
        let msg = ChatMessage::user("hi").with_name("42");
        let value = msg.to_openai_value();
        assert_eq!(value["role"], "user");
        assert_eq!(value["content"], "hi");
        assert_eq!(value["name"], "42");
    }

    #[test]
    fn multimodal_serializes_image_urls() {
        let msg = ChatMessage::user_multimodal(vec![
            ContentPart::Text("look".into()),
            ContentPart::ImageUrl {
                url: "https://cdn.example/cat.png".into(),
            },
        ]);
        let value = msg.to_openai_value();
        assert_eq!(value["content"][0]["type"], "text");
        assert_eq!(value["content"][1]["type"], "image_url");
        assert_eq!(
            value["content"][1]["image_url"]["url"],
            "https://cdn.example/cat.png"
        );
        assert!(value.get("name").is_none());
    }

    #[test]
    fn system_ignores_names() {
        let msg = ChatMessage::system("rules").with_name("bot");
        assert_eq!(msg, ChatMessage::system("rules"));
        assert_eq!(msg.role(), "system");
    }

    #[test]
    fn assistant_serializes_plain_content() {
        let value = ChatMessage::assistant("sure").with_name("7").to_openai_value();
        assert_eq!(value["role"], "assistant");
        assert_eq!(value["content"], "sure");
        assert_eq!(value["name"], "7");
    }
}
