//! Turning a streamed reply into platform messages.
//!
//! The reply is edited in place at most once per `edit_interval`. When the
//! text outgrows the platform limit the current message is closed at exactly
//! the limit and the rest continues in a new message that replies to it, so
//! concatenating the outputs in order always reproduces the streamed text.

use std::time::Duration;

use {
    tether_common::{ChannelId, MessageId},
    tokio::time::{Instant, sleep_until, timeout_at},
    tokio_util::sync::CancellationToken,
    tracing::{debug, warn},
};

use crate::{
    error::Result,
    plugin::{ChannelOutbound, OutputState, OutputTarget, StreamEvent, StreamReceiver},
};

#[derive(Debug, Clone, Copy)]
pub struct DispatchConfig {
    /// Minimum interval between in-place edits of a streaming message.
    pub edit_interval: Duration,
    /// Whole-generation deadline; exceeding it is an error.
    pub model_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            edit_interval: Duration::from_millis(1_000),
            model_timeout: Duration::from_secs(120),
        }
    }
}

/// How a dispatch ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Completed,
    Errored(String),
    /// A newer trigger took over the output target.
    Superseded,
}

/// One message emitted by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputMessage {
    pub id: MessageId,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub outcome: DispatchOutcome,
    /// Every message emitted, in order.
    pub outputs: Vec<OutputMessage>,
}

impl DispatchReport {
    /// Full reply text as emitted.
    #[must_use]
    pub fn text(&self) -> String {
        self.outputs.iter().map(|o| o.text.as_str()).collect()
    }
}

/// Where the reply goes.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub channel_id: ChannelId,
    /// The message that triggered the generation.
    pub trigger_id: MessageId,
    /// Warning lines shown on the first output message.
    pub notices: Vec<String>,
}

/// The message currently receiving text.
struct Current {
    id: MessageId,
    target: OutputTarget,
    text: String,
    chars: usize,
    limit: usize,
    /// Text changed since the last edit.
    dirty: bool,
    /// Already rendered as a closed message.
    closed: bool,
}

enum Next {
    Event(StreamEvent),
    Flush,
    Ended,
    TimedOut,
    Cancelled,
}

/// Per-generation streaming state machine.
pub struct StreamDispatcher<'a> {
    outbound: &'a dyn ChannelOutbound,
    config: DispatchConfig,
}

impl<'a> StreamDispatcher<'a> {
    pub fn new(outbound: &'a dyn ChannelOutbound, config: DispatchConfig) -> Self {
        Self { outbound, config }
    }

    /// Stream `events` into platform messages until the stream ends, fails,
    /// times out, or `cancel` fires.
    ///
    /// Delivery failures abort the generation and are returned as errors.
    pub async fn run(
        &self,
        request: DispatchRequest,
        mut events: StreamReceiver,
        cancel: CancellationToken,
    ) -> Result<DispatchReport> {
        let deadline = Instant::now() + self.config.model_timeout;
        let mut outputs: Vec<OutputMessage> = Vec::new();

        let target = OutputTarget {
            channel_id: request.channel_id,
            reply_to: Some(request.trigger_id),
            notices: request.notices,
        };
        let Some(mut current) = self.open(&cancel, target, String::new()).await? else {
            return Ok(superseded(outputs));
        };
        let mut last_edit = Instant::now();

        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => Next::Cancelled,
                received = timeout_at(deadline, events.recv()) => match received {
                    Ok(Some(event)) => Next::Event(event),
                    Ok(None) => Next::Ended,
                    Err(_) => Next::TimedOut,
                },
                () = sleep_until(last_edit + self.config.edit_interval), if current.dirty => Next::Flush,
            };

            match next {
                Next::Cancelled => {
                    debug!(message = %current.id, "stream superseded");
                    outputs.push(current.into_output());
                    return Ok(superseded(outputs));
                },
                Next::Flush => {
                    if !self.edit(&cancel, &mut current, OutputState::Streaming).await? {
                        outputs.push(current.into_output());
                        return Ok(superseded(outputs));
                    }
                    last_edit = Instant::now();
                },
                Next::Event(StreamEvent::Delta(delta)) => {
                    let mut rest = delta.as_str();
                    loop {
                        rest = current.append(rest);
                        if rest.is_empty() {
                            break;
                        }
                        // Full: close at exactly the limit, continue in a reply.
                        if !current.closed
                            && !self.edit(&cancel, &mut current, OutputState::Closed).await?
                        {
                            outputs.push(current.into_output());
                            return Ok(superseded(outputs));
                        }
                        let target = OutputTarget {
                            channel_id: current.target.channel_id.clone(),
                            reply_to: Some(current.id.clone()),
                            notices: Vec::new(),
                        };
                        let (head, tail) = split_chars(rest, self.outbound.text_limit(&[]));
                        rest = tail;
                        let state = if tail.is_empty() {
                            OutputState::Streaming
                        } else {
                            OutputState::Closed
                        };
                        outputs.push(current.into_output());
                        let opened = self
                            .send(&cancel, target, head.to_string(), state)
                            .await?;
                        let Some(next) = opened else {
                            return Ok(superseded(outputs));
                        };
                        current = next;
                        last_edit = Instant::now();
                    }
                },
                Next::Event(StreamEvent::Done) | Next::Ended => {
                    let finished = self.edit(&cancel, &mut current, OutputState::Done).await?;
                    outputs.push(current.into_output());
                    if !finished {
                        return Ok(superseded(outputs));
                    }
                    return Ok(DispatchReport {
                        outcome: DispatchOutcome::Completed,
                        outputs,
                    });
                },
                Next::Event(StreamEvent::Error(message)) => {
                    return self.fail(&cancel, current, outputs, message).await;
                },
                Next::TimedOut => {
                    let message = format!(
                        "model did not finish within {}s",
                        self.config.model_timeout.as_secs()
                    );
                    return self.fail(&cancel, current, outputs, message).await;
                },
            }
        }
    }

    async fn fail(
        &self,
        cancel: &CancellationToken,
        mut current: Current,
        mut outputs: Vec<OutputMessage>,
        message: String,
    ) -> Result<DispatchReport> {
        warn!(message = %current.id, error = %message, "generation failed");
        let marked = self.edit(cancel, &mut current, OutputState::Errored).await?;
        outputs.push(current.into_output());
        if !marked {
            return Ok(superseded(outputs));
        }
        Ok(DispatchReport {
            outcome: DispatchOutcome::Errored(message),
            outputs,
        })
    }

    /// Post the first message of the reply.
    async fn open(
        &self,
        cancel: &CancellationToken,
        target: OutputTarget,
        text: String,
    ) -> Result<Option<Current>> {
        self.send(cancel, target, text, OutputState::Streaming).await
    }

    async fn send(
        &self,
        cancel: &CancellationToken,
        target: OutputTarget,
        text: String,
        state: OutputState,
    ) -> Result<Option<Current>> {
        let sent = guarded(
            cancel,
            self.outbound.send_message(&target, &text, state),
        )
        .await?;
        Ok(sent.map(|id| Current {
            limit: self.outbound.text_limit(&target.notices),
            chars: text.chars().count(),
            id,
            target,
            text,
            dirty: false,
            closed: state == OutputState::Closed,
        }))
    }

    /// Edit the current message. Returns `false` when cancelled first.
    async fn edit(
        &self,
        cancel: &CancellationToken,
        current: &mut Current,
        state: OutputState,
    ) -> Result<bool> {
        let edited = guarded(
            cancel,
            self.outbound
                .edit_message(&current.target, &current.id, &current.text, state),
        )
        .await?;
        current.dirty = false;
        Ok(edited.is_some())
    }
}

impl Current {
    /// Append as much of `text` as fits; returns the remainder.
    fn append<'t>(&mut self, text: &'t str) -> &'t str {
        let room = self.limit.saturating_sub(self.chars);
        let (head, tail) = split_chars(text, room);
        if !head.is_empty() {
            self.text.push_str(head);
            self.chars += head.chars().count();
            self.dirty = true;
        }
        tail
    }

    fn into_output(self) -> OutputMessage {
        OutputMessage {
            id: self.id,
            text: self.text,
        }
    }
}

fn superseded(outputs: Vec<OutputMessage>) -> DispatchReport {
    DispatchReport {
        outcome: DispatchOutcome::Superseded,
        outputs,
    }
}

/// Split after `n` characters.
fn split_chars(text: &str, n: usize) -> (&str, &str) {
    match text.char_indices().nth(n) {
        Some((idx, _)) => text.split_at(idx),
        None => (text, ""),
    }
}

/// Run an outbound call unless `cancel` fires first.
async fn guarded<T>(
    cancel: &CancellationToken,
    call: impl Future<Output = Result<T>>,
) -> Result<Option<T>> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Ok(None),
        result = call => result.map(Some),
    }
}
