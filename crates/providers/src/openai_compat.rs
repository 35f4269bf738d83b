//! Parsing helpers for OpenAI-compatible chat-completions SSE streams.

use tracing::trace;

use crate::model::{StreamEvent, Usage};

/// Result of processing a single SSE line.
#[derive(Debug, PartialEq)]
pub enum SseLineResult {
    /// No actionable event (keep-alive, unparsable payload, empty delta)
    Skip,
    /// Stream is done
    Done,
    /// Events to yield
    Events(Vec<StreamEvent>),
}

/// Accumulated state across the lines of one stream.
#[derive(Debug, Default)]
pub struct StreamState {
    pub usage: Usage,
    pub finished: bool,
}

/// Extract the `data:` payload of an SSE line, if it carries one.
pub fn sse_data(line: &str) -> Option<&str> {
    let line = line.trim();
    line.strip_prefix("data: ")
        .or_else(|| line.strip_prefix("data:"))
        .map(str::trim)
        .filter(|data| !data.is_empty())
}

/// Parse the `usage` object some backends attach to the last chunk.
pub fn parse_usage(payload: &serde_json::Value) -> Option<Usage> {
    let usage = payload.get("usage").filter(|u| u.is_object())?;
    let read = |key: &str| {
        usage
            .get(key)
            .and_then(serde_json::Value::as_u64)
            .map_or(0, |n| u32::try_from(n).unwrap_or(u32::MAX))
    };
    Some(Usage {
        input_tokens: read("prompt_tokens"),
        output_tokens: read("completion_tokens"),
    })
}

/// Process one SSE `data:` payload.
///
/// In-band error objects (`{"error": {...}}`) terminate the stream with an
/// [`StreamEvent::Error`].
pub fn process_sse_line(data: &str, state: &mut StreamState) -> SseLineResult {
    if data == "[DONE]" {
        return SseLineResult::Done;
    }

    let Ok(evt) = serde_json::from_str::<serde_json::Value>(data) else {
        trace!(data, "skipping unparsable sse payload");
        return SseLineResult::Skip;
    };

    if let Some(error) = evt.get("error") {
        let message = error
            .get("message")
            .and_then(serde_json::Value::as_str)
            .map_or_else(|| error.to_string(), str::to_string);
        state.finished = true;
        return SseLineResult::Events(vec![StreamEvent::Error(message)]);
    }

    if let Some(usage) = parse_usage(&evt) {
        state.usage = usage;
    }

    let mut events = Vec::new();
    if let Some(content) = evt["choices"][0]["delta"]["content"].as_str()
        && !content.is_empty()
    {
        events.push(StreamEvent::Delta(content.to_string()));
    }

    if events.is_empty() {
        SseLineResult::Skip
    } else {
        SseLineResult::Events(events)
    }
}

/// Generate the terminal event once the byte stream ends or `[DONE]` arrives.
///
/// Returns nothing when an error already closed the stream.
pub fn finalize_stream(state: &mut StreamState) -> Option<StreamEvent> {
    if std::mem::replace(&mut state.finished, true) {
        return None;
    }
    Some(StreamEvent::Done(state.usage))
}
