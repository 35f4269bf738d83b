//! Discord event handler for serenity.
//!
//! Implements the EventHandler trait to receive and process Discord events.

use std::sync::{Arc, OnceLock};

use {
    serenity::{
        all::{
            ActivityData, ChannelId, Context, EventHandler, GatewayIntents, GuildId, Message,
            MessageId, MessageUpdateEvent, Ready,
        },
        async_trait,
    },
    tether_channels::{InboundContext, check_access},
    tether_chat::{ChatRuntime, RuntimeSettings},
    tether_config::BotConfig,
    tether_context::{ChainResolver, ContentExtractor, MessageCache, ResourceFetcher},
    tether_providers::LlmProvider,
    tracing::{debug, info, warn},
};

use crate::{platform::DiscordPlatform, render::Style};

/// Discord caps custom status text at 128 characters.
const STATUS_MAX_CHARS: usize = 128;

/// Wires gateway events of one bot account into its [`ChatRuntime`].
///
/// The runtime is built on the first `ready`, once the bot's own user id is
/// known.
pub struct DiscordHandler {
    config: BotConfig,
    provider: Arc<dyn LlmProvider>,
    fetcher: Arc<dyn ResourceFetcher>,
    cache_capacity: usize,
    session: OnceLock<Session>,
}

struct Session {
    platform: Arc<DiscordPlatform>,
    runtime: Arc<ChatRuntime>,
}

impl DiscordHandler {
    pub fn new(
        config: BotConfig,
        provider: Arc<dyn LlmProvider>,
        fetcher: Arc<dyn ResourceFetcher>,
        cache_capacity: usize,
    ) -> Self {
        Self {
            config,
            provider,
            fetcher,
            cache_capacity,
            session: OnceLock::new(),
        }
    }

    /// Required gateway intents for the bot.
    pub fn intents() -> GatewayIntents {
        GatewayIntents::GUILDS
            | GatewayIntents::GUILD_MESSAGES
            | GatewayIntents::DIRECT_MESSAGES
            | GatewayIntents::MESSAGE_CONTENT
    }

    fn start_session(&self, ctx: &Context, ready: &Ready) -> &Session {
        self.session.get_or_init(|| {
            let platform = Arc::new(DiscordPlatform::new(
                Arc::clone(&ctx.http),
                ready.user.id,
                Style::from_plain_flag(self.config.use_plain_responses),
            ));
            let resolver = ChainResolver::new(
                Arc::new(MessageCache::new(self.cache_capacity)),
                Arc::clone(&platform) as Arc<dyn tether_context::MessageSource>,
                ContentExtractor::new(Arc::clone(&self.fetcher)),
            );
            let settings = RuntimeSettings::from_bot(&self.config, ready.user.id.get().into());
            let runtime = Arc::new(ChatRuntime::new(
                settings,
                resolver,
                Arc::clone(&self.provider),
                Arc::clone(&platform) as Arc<dyn tether_channels::ChannelOutbound>,
            ));
            Session { platform, runtime }
        })
    }

    fn forget(&self, id: MessageId) {
        if let Some(session) = self.session.get()
            && session.runtime.cache().invalidate(&id.get().into())
        {
            debug!(bot = %self.config.name, message = %id, "dropped cached message");
        }
    }
}

/// Presence text, cut to what Discord accepts.
fn status_text(status: &str) -> Option<String> {
    let status = status.trim();
    (!status.is_empty()).then(|| status.chars().take(STATUS_MAX_CHARS).collect())
}

#[async_trait]
impl EventHandler for DiscordHandler {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!(
            bot = %self.config.name,
            bot_name = %ready.user.name,
            guilds = ready.guilds.len(),
            model = %self.config.model,
            "discord bot ready"
        );
        self.start_session(&ctx, &ready);

        if let Some(status) = status_text(&self.config.status_message) {
            ctx.set_activity(Some(ActivityData::custom(status)));
        }
    }

    async fn message(&self, _ctx: Context, msg: Message) {
        // Skip bot messages to prevent loops
        if msg.author.bot {
            return;
        }
        let Some(session) = self.session.get() else {
            debug!(bot = %self.config.name, "message before ready, ignoring");
            return;
        };
        let platform = &session.platform;

        let info = match platform.channel_info(msg.channel_id).await {
            Ok(info) => info,
            Err(e) => {
                warn!(bot = %self.config.name, channel = %msg.channel_id, error = %e, "channel lookup failed");
                return;
            },
        };
        if !info.conversational {
            return;
        }

        let channel_id = msg.channel_id.to_string();
        let parent_channel_id = info.thread_parent.map(|p: ChannelId| p.to_string());
        let member_roles: Vec<String> = msg
            .member
            .as_ref()
            .map(|member| member.roles.iter().map(|r| r.to_string()).collect())
            .unwrap_or_default();
        let inbound = InboundContext {
            author_is_bot: msg.author.bot,
            is_dm: msg.guild_id.is_none(),
            channel_id: &channel_id,
            parent_channel_id: parent_channel_id.as_deref(),
            author_role_ids: &member_roles,
            mentioned: msg.mentions.iter().any(|u| u.id == platform.bot_id()),
        };
        if let Err(reason) = check_access(&self.config, &inbound) {
            debug!(bot = %self.config.name, message = %msg.id, ?reason, "ignoring message");
            return;
        }

        let raw = crate::convert::to_raw(&msg, platform.bot_id(), info.thread_parent);
        debug!(
            bot = %self.config.name,
            message = %msg.id,
            author = %msg.author.id,
            attachments = raw.attachments.len(),
            "trigger accepted"
        );
        // Each gateway event runs in its own task.
        if let Err(e) = session.runtime.handle_trigger(raw).await {
            warn!(bot = %self.config.name, message = %msg.id, error = %e, "reply delivery failed");
        }
    }

    async fn message_update(
        &self,
        _ctx: Context,
        _old: Option<Message>,
        _new: Option<Message>,
        event: MessageUpdateEvent,
    ) {
        self.forget(event.id);
    }

    async fn message_delete(
        &self,
        _ctx: Context,
        _channel_id: ChannelId,
        deleted_message_id: MessageId,
        _guild_id: Option<GuildId>,
    ) {
        self.forget(deleted_message_id);
    }
}
