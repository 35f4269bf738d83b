use std::{sync::Arc, time::Duration};

use {
    secrecy::ExposeSecret,
    serenity::Client,
    tether_config::{BotConfig, CacheConfig, ProvidersConfig},
    tether_context::HttpResourceFetcher,
    tether_providers::provider_for_bot,
    tokio_util::sync::CancellationToken,
    tracing::info,
};

use crate::handler::DiscordHandler;

/// Timeout for fetching linked pages and attachments.
const RESOURCE_TIMEOUT: Duration = Duration::from_secs(10);

/// Connect one bot account and serve it until `cancel` fires or the gateway
/// connection fails.
pub async fn run_bot(
    config: BotConfig,
    providers: &ProvidersConfig,
    cache: CacheConfig,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    if !config.has_token() {
        anyhow::bail!("bot '{}': bot_token is empty", config.name);
    }
    let provider = provider_for_bot(&config, providers)?;
    let fetcher = Arc::new(HttpResourceFetcher::new(RESOURCE_TIMEOUT)?);
    let name = config.name.clone();
    let token = config.bot_token.expose_secret().clone();

    let handler = DiscordHandler::new(config, provider, fetcher, cache.capacity);
    let mut client = Client::builder(&token, DiscordHandler::intents())
        .event_handler(handler)
        .await?;

    let shard_manager = Arc::clone(&client.shard_manager);
    let stop = cancel.clone();
    let bot = name.clone();
    tokio::spawn(async move {
        stop.cancelled().await;
        info!(bot = %bot, "shutting down discord client");
        shard_manager.shutdown_all().await;
    });

    info!(bot = %name, "connecting to discord");
    client.start().await?;
    info!(bot = %name, "discord client stopped");
    Ok(())
}
