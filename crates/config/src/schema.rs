/// Config schema types (providers, bots, limits, streaming, cache).
use std::collections::HashMap;

use {
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
};

/// Root configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TetherConfig {
    pub providers: ProvidersConfig,
    /// Every entry runs as an independent bot in the same process.
    pub bots: Vec<BotConfig>,
    pub cache: CacheConfig,
}

/// LLM provider settings keyed by provider name (`openai`, `ollama`, ...).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProvidersConfig {
    #[serde(flatten)]
    pub providers: HashMap<String, ProviderEntry>,
}

impl ProvidersConfig {
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ProviderEntry> {
        self.providers.get(name)
    }
}

/// Configuration for a single OpenAI-compatible endpoint.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct ProviderEntry {
    /// Base URL of the chat-completions API, without the `/chat/completions` suffix.
    pub base_url: String,

    /// API key; local servers usually need none.
    pub api_key: Option<Secret<String>>,
}

impl std::fmt::Debug for ProviderEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderEntry")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl Default for ProviderEntry {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".into(),
            api_key: None,
        }
    }
}

/// Mention activation mode for guild channels.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MentionMode {
    /// Bot must be @mentioned to respond.
    #[default]
    Mention,
    /// Bot responds to every message in allowed channels.
    Always,
}

/// DM access policy.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DmPolicy {
    /// Anyone can DM the bot.
    #[default]
    Open,
    /// DMs disabled.
    Disabled,
}

/// How conversation context is gathered for a trigger message.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContextMode {
    /// Follow reply references back from the trigger.
    #[default]
    ReplyChain,
    /// Use the most recent messages of the channel.
    ChannelWindow,
}

/// Configuration for one bot account.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    /// Label used in logs.
    pub name: String,

    /// Discord bot token.
    pub bot_token: Secret<String>,

    /// Model in `provider/model` form, e.g. `openai/gpt-4o`.
    pub model: String,

    pub system_prompt: String,

    /// Custom presence text (truncated to 128 characters).
    pub status_message: String,

    /// Channel (or thread parent) IDs the bot answers in. Empty = all.
    pub allowed_channel_ids: Vec<String>,

    /// Role IDs allowed to trigger the bot. Empty = all. A non-empty list
    /// also refuses DMs, since DM authors carry no roles.
    pub allowed_role_ids: Vec<String>,

    pub mention_mode: MentionMode,

    pub dm_policy: DmPolicy,

    pub context_mode: ContextMode,

    /// Send plain message content instead of embeds.
    pub use_plain_responses: bool,

    /// Extra fields merged into every chat-completions request body.
    pub extra_api_parameters: serde_json::Map<String, serde_json::Value>,

    /// Override vision detection for the configured model.
    pub vision: Option<bool>,

    /// Override named-author detection for the configured model.
    pub names: Option<bool>,

    pub limits: LimitsConfig,

    pub streaming: StreamingConfig,
}

impl BotConfig {
    /// Split `model` into `(provider, model_id)`.
    #[must_use]
    pub fn model_parts(&self) -> Option<(&str, &str)> {
        let (provider, model) = self.model.split_once('/')?;
        if provider.is_empty() || model.is_empty() {
            return None;
        }
        Some((provider, model))
    }

    #[must_use]
    pub fn has_token(&self) -> bool {
        !self.bot_token.expose_secret().trim().is_empty()
    }
}

impl std::fmt::Debug for BotConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotConfig")
            .field("name", &self.name)
            .field("bot_token", &"[REDACTED]")
            .field("model", &self.model)
            .field("context_mode", &self.context_mode)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            name: "default".into(),
            bot_token: Secret::new(String::new()),
            model: "openai/gpt-4o".into(),
            system_prompt: "You are a helpful assistant.".into(),
            status_message: String::new(),
            allowed_channel_ids: Vec::new(),
            allowed_role_ids: Vec::new(),
            mention_mode: MentionMode::default(),
            dm_policy: DmPolicy::default(),
            context_mode: ContextMode::default(),
            use_plain_responses: false,
            extra_api_parameters: serde_json::Map::new(),
            vision: None,
            names: None,
            limits: LimitsConfig::default(),
            streaming: StreamingConfig::default(),
        }
    }
}

/// Size limits applied while assembling conversation context.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum characters per message / turn.
    pub max_text: usize,
    /// Maximum images per message / turn.
    pub max_images: usize,
    /// Maximum messages (turns) per conversation.
    pub max_messages: usize,
    /// Maximum linked pages fetched per message.
    pub max_links: usize,
    /// Word cap applied to each linked page before it joins the text budget.
    pub max_link_words: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_text: 100_000,
            max_images: 5,
            max_messages: 25,
            max_links: 1,
            max_link_words: 1_000,
        }
    }
}

/// Response streaming behaviour.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StreamingConfig {
    /// Minimum interval between in-place edits (ms).
    pub edit_interval_ms: u64,
    /// Model calls running longer than this are aborted as errors.
    pub model_timeout_secs: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            edit_interval_ms: 1_000,
            model_timeout_secs: 120,
        }
    }
}

/// Message cache sizing. Each bot keeps its own cache of this size, since
/// resolved messages depend on the bot identity and model.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { capacity: 500 }
    }
}
