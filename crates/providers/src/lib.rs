//! LLM provider implementations and capability detection.
//!
//! Every backend speaks the OpenAI-compatible chat-completions protocol; the
//! provider half of a bot's `provider/model` string picks the endpoint from
//! the `[providers]` config table.

pub mod model;
pub mod openai;
pub mod openai_compat;

use std::sync::Arc;

use tether_config::{BotConfig, ProviderEntry, ProvidersConfig};

pub use {
    model::{ChatMessage, ContentPart, EventStream, LlmProvider, StreamEvent, Usage, UserContent},
    openai::OpenAiProvider,
};

/// Shared HTTP client for LLM providers.
///
/// All providers that don't need custom redirect/proxy settings should
/// reuse this client to share connection pools, DNS cache, and TLS sessions.
pub fn shared_http_client() -> &'static reqwest::Client {
    static CLIENT: std::sync::LazyLock<reqwest::Client> =
        std::sync::LazyLock::new(reqwest::Client::new);
    &CLIENT
}

/// Model-name fragments of families that accept image inputs.
const VISION_MODEL_TAGS: &[&str] = &[
    "gpt-4o",
    "gpt-4-turbo",
    "gpt-4.1",
    "gpt-5",
    "o3",
    "o4",
    "claude-",
    "gemini",
    "llava",
    "vision",
    "pixtral",
];

/// Check if a model supports vision (image inputs).
///
/// Matches on fragments anywhere in the id so namespaced ids such as
/// `meta-llama/llama-3.2-11b-vision` or `llava:13b` are recognised.
#[must_use]
pub fn supports_vision_for_model(model_id: &str) -> bool {
    let id = model_id.to_ascii_lowercase();
    // `o3`/`o4` are only meaningful as a prefix.
    VISION_MODEL_TAGS.iter().any(|tag| match *tag {
        "o3" | "o4" => id.starts_with(tag),
        _ => id.contains(tag),
    })
}

/// Whether the provider accepts the per-message `name` field.
#[must_use]
pub fn supports_names_for_provider(provider: &str) -> bool {
    provider.eq_ignore_ascii_case("openai")
}

/// Resolved capabilities of a bot's configured model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelCapabilities {
    pub vision: bool,
    pub names: bool,
}

impl ModelCapabilities {
    /// Detect capabilities, honouring the `vision`/`names` overrides in `bot`.
    #[must_use]
    pub fn for_bot(bot: &BotConfig) -> Self {
        let (provider, model) = bot.model_parts().unwrap_or(("", bot.model.as_str()));
        Self {
            vision: bot
                .vision
                .unwrap_or_else(|| supports_vision_for_model(model)),
            names: bot
                .names
                .unwrap_or_else(|| supports_names_for_provider(provider)),
        }
    }
}

/// Build the provider for a bot from the providers table.
///
/// `openai` falls back to the public endpoint with `OPENAI_API_KEY` when no
/// table entry exists; any other provider must be configured.
pub fn provider_for_bot(
    bot: &BotConfig,
    providers: &ProvidersConfig,
) -> anyhow::Result<Arc<dyn LlmProvider>> {
    let Some((provider, model)) = bot.model_parts() else {
        anyhow::bail!(
            "bot '{}': model '{}' must be in provider/model form",
            bot.name,
            bot.model
        );
    };

    let entry = match providers.get(provider) {
        Some(entry) => entry.clone(),
        None if supports_names_for_provider(provider) => ProviderEntry {
            api_key: std::env::var("OPENAI_API_KEY")
                .ok()
                .map(secrecy::Secret::new),
            ..ProviderEntry::default()
        },
        None => anyhow::bail!(
            "bot '{}': provider '{provider}' is not configured under [providers]",
            bot.name
        ),
    };

    let client = OpenAiProvider::new(provider, entry.api_key, model, entry.base_url)
        .with_extra_body(bot.extra_api_parameters.clone());
    Ok(Arc::new(client))
}
