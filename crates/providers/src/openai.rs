use {
    futures::StreamExt,
    secrecy::{ExposeSecret, Secret},
    tracing::{debug, trace},
};

use crate::{
    model::{ChatMessage, EventStream, LlmProvider, StreamEvent},
    openai_compat::{SseLineResult, StreamState, finalize_stream, process_sse_line, sse_data},
};

/// Fields owned by the request builder; extra parameters never override them.
const RESERVED_BODY_KEYS: &[&str] = &["model", "messages", "stream"];

/// Streaming client for any OpenAI-compatible `/chat/completions` endpoint.
pub struct OpenAiProvider {
    provider_name: String,
    api_key: Option<Secret<String>>,
    model: String,
    base_url: String,
    extra_body: serde_json::Map<String, serde_json::Value>,
    client: &'static reqwest::Client,
}

impl OpenAiProvider {
    pub fn new(
        provider_name: impl Into<String>,
        api_key: Option<Secret<String>>,
        model: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            provider_name: provider_name.into(),
            api_key,
            model: model.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            extra_body: serde_json::Map::new(),
            client: crate::shared_http_client(),
        }
    }

    /// Extra fields merged into every request body (temperature, max_tokens, ...).
    #[must_use]
    pub fn with_extra_body(mut self, extra: serde_json::Map<String, serde_json::Value>) -> Self {
        self.extra_body = extra;
        self
    }

    fn request_body(&self, messages: &[ChatMessage]) -> serde_json::Value {
        let openai_messages: Vec<serde_json::Value> =
            messages.iter().map(ChatMessage::to_openai_value).collect();

        let mut body = serde_json::Map::new();
        for (key, value) in &self.extra_body {
            if !RESERVED_BODY_KEYS.contains(&key.as_str()) {
                body.insert(key.clone(), value.clone());
            }
        }
        body.insert("model".into(), self.model.clone().into());
        body.insert("messages".into(), openai_messages.into());
        body.insert("stream".into(), true.into());
        serde_json::Value::Object(body)
    }
}

impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.provider_name
    }

    fn id(&self) -> &str {
        &self.model
    }

    fn stream(&self, messages: Vec<ChatMessage>) -> EventStream<'_> {
        Box::pin(async_stream::stream! {
            let body = self.request_body(&messages);

            debug!(
                provider = %self.provider_name,
                model = %self.model,
                messages_count = messages.len(),
                "openai stream request"
            );
            trace!(body = %body, "openai stream request body");

            let mut request = self
                .client
                .post(format!("{}/chat/completions", self.base_url))
                .header("content-type", "application/json")
                .json(&body);
            if let Some(key) = &self.api_key {
                request = request.bearer_auth(key.expose_secret());
            }

            let resp = match request.send().await {
                Ok(r) => {
                    if let Err(e) = r.error_for_status_ref() {
                        let status = e.status().map_or(0, |s| s.as_u16());
                        let body_text = r.text().await.unwrap_or_default();
                        yield StreamEvent::Error(format!("HTTP {status}: {body_text}"));
                        return;
                    }
                    r
                },
                Err(e) => {
                    yield StreamEvent::Error(e.to_string());
                    return;
                },
            };

            let mut byte_stream = resp.bytes_stream();
            // Raw bytes: a chunk boundary may fall inside a UTF-8 sequence.
            let mut buf: Vec<u8> = Vec::new();
            let mut state = StreamState::default();

            while let Some(chunk) = byte_stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        yield StreamEvent::Error(e.to_string());
                        return;
                    },
                };
                buf.extend_from_slice(&chunk);

                while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                    let raw: Vec<u8> = buf.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&raw);
                    let Some(data) = sse_data(&line) else {
                        continue;
                    };

                    match process_sse_line(data, &mut state) {
                        SseLineResult::Done => {
                            if let Some(event) = finalize_stream(&mut state) {
                                yield event;
                            }
                            return;
                        },
                        SseLineResult::Events(events) => {
                            for event in events {
                                yield event;
                            }
                            if state.finished {
                                return;
                            }
                        },
                        SseLineResult::Skip => {},
                    }
                }
            }

            // Backends may close without [DONE] or a trailing newline.
            let rest = String::from_utf8_lossy(&buf);
            if let Some(data) = sse_data(&rest) {
                match process_sse_line(data, &mut state) {
                    SseLineResult::Events(events) => {
                        for event in events {
                            yield event;
                        }
                    },
                    SseLineResult::Done | SseLineResult::Skip => {},
                }
            }

            if let Some(event) = finalize_stream(&mut state) {
                yield event;
            }
        })
    }
}
