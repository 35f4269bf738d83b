use {
    async_trait::async_trait,
    tether_common::{ChannelId, MessageId},
    tokio::sync::mpsc,
};

use crate::error::Result;

/// Rendering state of one output message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputState {
    /// Still receiving text; rendered with a streaming indicator.
    Streaming,
    /// Full message that was split off; later text continues elsewhere.
    Closed,
    /// Last message of a completed reply.
    Done,
    /// Generation failed; rendered with an error indicator.
    Errored,
}

impl OutputState {
    #[must_use]
    pub fn is_final(self) -> bool {
        !matches!(self, Self::Streaming)
    }
}

/// Where and how an output message is posted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputTarget {
    pub channel_id: ChannelId,
    /// Message the output replies to.
    pub reply_to: Option<MessageId>,
    /// Warning lines shown alongside this message.
    pub notices: Vec<String>,
}

/// Send and edit messages on a chat platform.
#[async_trait]
pub trait ChannelOutbound: Send + Sync {
    /// Maximum body characters of a message carrying `notices`.
    fn text_limit(&self, notices: &[String]) -> usize;

    /// Post a new message and return its id.
    async fn send_message(
        &self,
        target: &OutputTarget,
        text: &str,
        state: OutputState,
    ) -> Result<MessageId>;

    /// Replace the body of a message previously sent to `target`.
    async fn edit_message(
        &self,
        target: &OutputTarget,
        id: &MessageId,
        text: &str,
        state: OutputState,
    ) -> Result<()>;

    /// Send a "typing" indicator. No-op by default.
    async fn send_typing(&self, _channel: &ChannelId) -> Result<()> {
        Ok(())
    }
}

/// Stream event for edit-in-place streaming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A chunk of text to append.
    Delta(String),
    /// Stream is complete.
    Done,
    /// An error occurred.
    Error(String),
}

/// Receiver end of a stream channel.
pub type StreamReceiver = mpsc::Receiver<StreamEvent>;

/// Sender end of a stream channel.
pub type StreamSender = mpsc::Sender<StreamEvent>;
