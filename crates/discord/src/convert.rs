//! serenity messages → [`RawMessage`].

use {
    chrono::{DateTime, Utc},
    serenity::all::{ChannelId, Message, UserId},
    tether_context::{MessageRef, RawAttachment, RawMessage},
};

use crate::render::strip_rendering;

/// Milliseconds between the Unix epoch and the Discord epoch (2015-01-01).
const DISCORD_EPOCH_MS: u64 = 1_420_070_400_000;

/// Creation time encoded in a snowflake id.
#[must_use]
pub fn snowflake_time(id: u64) -> DateTime<Utc> {
    let millis = (id >> 22).saturating_add(DISCORD_EPOCH_MS);
    i64::try_from(millis)
        .ok()
        .and_then(DateTime::from_timestamp_millis)
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Drop a leading `<@id>` / `<@!id>` mention of the bot.
#[must_use]
pub fn strip_bot_mention(text: &str, bot_id: u64) -> &str {
    let plain = format!("<@{bot_id}>");
    let nick = format!("<@!{bot_id}>");
    let trimmed = text.trim_start();
    trimmed
        .strip_prefix(plain.as_str())
        .or_else(|| trimmed.strip_prefix(nick.as_str()))
        .map_or(text, str::trim_start)
}

/// Body text: message content followed by embed descriptions.
///
/// Our own messages carry their body in an embed (or plain content) with
/// streaming/error decorations that are removed here.
#[must_use]
pub fn message_text<'a>(
    content: &str,
    embed_descriptions: impl IntoIterator<Item = &'a str>,
    is_self: bool,
    bot_id: u64,
) -> String {
    let mut parts: Vec<&str> = Vec::new();
    let content = if is_self {
        strip_rendering(content)
    } else {
        strip_bot_mention(content, bot_id)
    };
    if !content.trim().is_empty() {
        parts.push(content);
    }
    for description in embed_descriptions {
        let description = if is_self {
            strip_rendering(description)
        } else {
            description
        };
        if !description.trim().is_empty() {
            parts.push(description);
        }
    }
    parts.join("\n")
}

/// The message this one continues: an explicit reply, or the thread's
/// starter message for the first message of a thread.
#[must_use]
pub fn parent_ref(
    reference: Option<(ChannelId, Option<serenity::all::MessageId>)>,
    channel_id: ChannelId,
    thread_parent: Option<ChannelId>,
) -> Option<MessageRef> {
    match reference {
        Some((ref_channel, Some(ref_message))) => Some(MessageRef::new(
            ref_channel.get(),
            ref_message.get(),
        )),
        Some((_, None)) => None,
        // A thread's id is the id of the message it was started from.
        None => thread_parent.map(|parent| MessageRef::new(parent.get(), channel_id.get())),
    }
}

/// Convert a serenity message. `thread_parent` is the parent channel when
/// `msg` was posted in a thread.
#[must_use]
pub fn to_raw(msg: &Message, bot_id: UserId, thread_parent: Option<ChannelId>) -> RawMessage {
    let is_self = msg.author.id == bot_id;
    let text = message_text(
        &msg.content,
        msg.embeds.iter().filter_map(|e| e.description.as_deref()),
        is_self,
        bot_id.get(),
    );
    let attachments = msg
        .attachments
        .iter()
        .map(|a| RawAttachment {
            url: a.url.clone(),
            filename: a.filename.clone(),
            content_type: a.content_type.clone(),
        })
        .collect();
    let reference = msg
        .message_reference
        .as_ref()
        .map(|r| (r.channel_id, r.message_id));

    RawMessage {
        id: msg.id.get().into(),
        channel_id: msg.channel_id.get().into(),
        author_id: msg.author.id.get().into(),
        is_self,
        text,
        attachments,
        parent: parent_ref(reference, msg.channel_id, thread_parent),
        created_at: snowflake_time(msg.id.get()),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest, serenity::all::MessageId};

    #[test]
    fn snowflake_timestamps() {
        // Discord's documented example snowflake.
        let t = snowflake_time(175_928_847_299_117_063);
        assert_eq!(t.timestamp_millis(), 1_462_015_105_796);
        assert!(snowflake_time(2) < snowflake_time(1 << 23));
    }

    #[rstest]
    #[case("<@42> hello", "hello")]
    #[case("  <@!42>   hello", "hello")]
    #[case("hello <@42>", "hello <@42>")]
    #[case("<@43> hello", "<@43> hello")]
    #[case("<@42>", "")]
    fn mention_stripping(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(strip_bot_mention(input, 42), expected);
    }

    #[test]
    fn user_text_includes_embeds() {
        let text = message_text("<@42> look", ["linked preview"], false, 42);
        assert_eq!(text, "look\nlinked preview");
    }

    #[test]
    fn own_embed_loses_indicator() {
        let text = message_text("", ["partial answer ⚪"], true, 42);
        assert_eq!(text, "partial answer");
        let plain = message_text("done ⚠️ error", [], true, 42);
        assert_eq!(plain, "done");
    }

    #[test]
    fn reply_reference_wins() {
        let parent = parent_ref(
            Some((ChannelId::new(10), Some(MessageId::new(5)))),
            ChannelId::new(20),
            Some(ChannelId::new(30)),
        );
        assert_eq!(parent, Some(MessageRef::new("10", "5")));
    }

    #[test]
    fn first_thread_message_points_at_starter() {
        let parent = parent_ref(None, ChannelId::new(20), Some(ChannelId::new(30)));
        assert_eq!(parent, Some(MessageRef::new("30", "20")));
        assert_eq!(parent_ref(None, ChannelId::new(20), None), None);
    }
}
