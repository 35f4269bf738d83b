//! Discord implementations of the pipeline's platform traits.

use std::{num::NonZeroU64, sync::Arc};

use {
    async_trait::async_trait,
    dashmap::DashMap,
    serenity::{
        all::{
            Channel, ChannelId, ChannelType, Colour, CreateEmbed, CreateMessage, EditMessage,
            GetMessages, Http, Message, MessageId, MessageReference, UserId,
        },
        http::HttpError,
    },
    tether_channels::{ChannelOutbound, OutputState, OutputTarget},
    tether_context::{MessageRef, MessageSource, RawMessage},
    tracing::debug,
};

use crate::{
    convert::to_raw,
    render::{Style, Tone, embed_description, plain_content},
};

/// Discord caps a history page at 100 messages.
const HISTORY_PAGE: usize = 100;

/// What the adapter needs to know about a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelInfo {
    /// Text channel, thread or DM.
    pub conversational: bool,
    /// Parent channel when the channel is a thread.
    pub thread_parent: Option<ChannelId>,
}

impl ChannelInfo {
    fn from_channel(channel: &Channel) -> Self {
        match channel {
            Channel::Guild(guild) => {
                let thread = matches!(
                    guild.kind,
                    ChannelType::PublicThread | ChannelType::PrivateThread | ChannelType::NewsThread
                );
                Self {
                    conversational: thread
                        || matches!(guild.kind, ChannelType::Text | ChannelType::News),
                    thread_parent: if thread { guild.parent_id } else { None },
                }
            },
            Channel::Private(_) => Self {
                conversational: true,
                thread_parent: None,
            },
            _ => Self {
                conversational: false,
                thread_parent: None,
            },
        }
    }
}

/// One bot's view of Discord: fetches history and delivers replies.
pub struct DiscordPlatform {
    http: Arc<Http>,
    bot_id: UserId,
    style: Style,
    channels: DashMap<ChannelId, ChannelInfo>,
}

impl DiscordPlatform {
    pub fn new(http: Arc<Http>, bot_id: UserId, style: Style) -> Self {
        Self {
            http,
            bot_id,
            style,
            channels: DashMap::new(),
        }
    }

    #[must_use]
    pub fn bot_id(&self) -> UserId {
        self.bot_id
    }

    fn http(&self) -> &Http {
        &self.http
    }

    /// Channel kind and thread parent, looked up once per channel.
    pub async fn channel_info(&self, id: ChannelId) -> serenity::Result<ChannelInfo> {
        if let Some(info) = self.channels.get(&id) {
            return Ok(*info);
        }
        let channel = id.to_channel(self.http()).await?;
        let info = ChannelInfo::from_channel(&channel);
        self.channels.insert(id, info);
        Ok(info)
    }

    /// Convert `msg`, resolving its thread parent.
    pub async fn raw_message(&self, msg: &Message) -> RawMessage {
        let thread_parent = match self.channel_info(msg.channel_id).await {
            Ok(info) => info.thread_parent,
            Err(e) => {
                debug!(channel = %msg.channel_id, error = %e, "channel lookup failed");
                None
            },
        };
        to_raw(msg, self.bot_id, thread_parent)
    }

    fn create_message(&self, target: &OutputTarget, text: &str, state: OutputState) -> CreateMessage {
        let builder = match self.style {
            Style::Embed => CreateMessage::new().embed(embed(text, &target.notices, state)),
            Style::Plain => CreateMessage::new().content(plain_content(text, &target.notices, state)),
        };
        match reply_reference(target) {
            Some(reference) => builder.reference_message(reference),
            None => builder,
        }
    }

    fn edit(&self, target: &OutputTarget, text: &str, state: OutputState) -> EditMessage {
        match self.style {
            Style::Embed => EditMessage::new().embed(embed(text, &target.notices, state)),
            Style::Plain => EditMessage::new().content(plain_content(text, &target.notices, state)),
        }
    }
}

fn embed(text: &str, notices: &[String], state: OutputState) -> CreateEmbed {
    let colour = match Tone::for_state(state) {
        Tone::Incomplete => Colour::ORANGE,
        Tone::Complete => Colour::DARK_GREEN,
        Tone::Failed => Colour::RED,
    };
    notices.iter().fold(
        CreateEmbed::new()
            .description(embed_description(text, state))
            .colour(colour),
        |embed, notice| embed.field(notice, "", false),
    )
}

fn reply_reference(target: &OutputTarget) -> Option<MessageReference> {
    let channel = channel_id(target.channel_id.as_str())?;
    let message = message_id(target.reply_to.as_ref()?.as_str())?;
    Some(MessageReference::from((channel, message)))
}

fn channel_id(id: &str) -> Option<ChannelId> {
    id.parse::<NonZeroU64>().ok().map(ChannelId::from)
}

fn message_id(id: &str) -> Option<MessageId> {
    id.parse::<NonZeroU64>().ok().map(MessageId::from)
}

fn is_not_found(err: &serenity::Error) -> bool {
    matches!(
        err,
        serenity::Error::Http(HttpError::UnsuccessfulRequest(response))
            if response.status_code.as_u16() == 404
    )
}

#[async_trait]
impl MessageSource for DiscordPlatform {
    async fn fetch_message(&self, at: &MessageRef) -> tether_context::Result<Option<RawMessage>> {
        let (Some(channel), Some(id)) = (
            channel_id(at.channel_id.as_str()),
            message_id(at.message_id.as_str()),
        ) else {
            return Ok(None);
        };
        match channel.message(self.http(), id).await {
            Ok(msg) => Ok(Some(self.raw_message(&msg).await)),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(tether_context::Error::external(
                format!("fetch message {}", at.message_id),
                e,
            )),
        }
    }

    async fn fetch_channel_window(
        &self,
        channel: &tether_common::ChannelId,
        before: &tether_common::MessageId,
        limit: usize,
    ) -> tether_context::Result<Vec<RawMessage>> {
        let (Some(channel), Some(mut cursor)) = (
            channel_id(channel.as_str()),
            message_id(before.as_str()),
        ) else {
            return Ok(Vec::new());
        };

        let mut history: Vec<Message> = Vec::with_capacity(limit);
        while history.len() < limit {
            let page = (limit - history.len()).min(HISTORY_PAGE);
            let batch = channel
                .messages(
                    self.http(),
                    GetMessages::new()
                        .before(cursor)
                        .limit(u8::try_from(page).unwrap_or(u8::MAX)),
                )
                .await
                .map_err(|e| tether_context::Error::external("fetch channel history", e))?;
            let fetched = batch.len();
            // Pages come newest first.
            let Some(oldest) = batch.last().map(|m| m.id) else {
                break;
            };
            cursor = oldest;
            history.extend(batch);
            if fetched < page {
                break;
            }
        }

        let thread_parent = self
            .channel_info(channel)
            .await
            .ok()
            .and_then(|info| info.thread_parent);
        Ok(history
            .iter()
            .map(|msg| to_raw(msg, self.bot_id, thread_parent))
            .collect())
    }
}

#[async_trait]
impl ChannelOutbound for DiscordPlatform {
    fn text_limit(&self, notices: &[String]) -> usize {
        self.style.text_limit(notices)
    }

    async fn send_message(
        &self,
        target: &OutputTarget,
        text: &str,
        state: OutputState,
    ) -> tether_channels::Result<tether_common::MessageId> {
        let channel = channel_id(target.channel_id.as_str()).ok_or_else(|| {
            tether_channels::Error::invalid_input(format!("bad channel id {}", target.channel_id))
        })?;
        let sent = channel
            .send_message(self.http(), self.create_message(target, text, state))
            .await
            .map_err(|e| tether_channels::Error::delivery("send message", e))?;
        Ok(sent.id.get().into())
    }

    async fn edit_message(
        &self,
        target: &OutputTarget,
        id: &tether_common::MessageId,
        text: &str,
        state: OutputState,
    ) -> tether_channels::Result<()> {
        let (Some(channel), Some(message)) = (
            channel_id(target.channel_id.as_str()),
            message_id(id.as_str()),
        ) else {
            return Err(tether_channels::Error::invalid_input(format!(
                "bad message location {}/{id}",
                target.channel_id
            )));
        };
        channel
            .edit_message(self.http(), message, self.edit(target, text, state))
            .await
            .map_err(|e| tether_channels::Error::delivery("edit message", e))?;
        Ok(())
    }

    async fn send_typing(&self, channel: &tether_common::ChannelId) -> tether_channels::Result<()> {
        let Some(channel) = channel_id(channel.as_str()) else {
            return Ok(());
        };
        channel
            .broadcast_typing(&self.http)
            .await
            .map_err(|e| tether_channels::Error::delivery("typing", e))
    }
}
