//! One bot's chat engine.
//!
//! A trigger runs through resolve → build → model call → dispatch. Every
//! generation owns a [`CancellationToken`] registered under its
//! [`TargetKey`]; a newer trigger for the same key cancels the older one.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    chrono::Utc,
    futures::StreamExt,
    tether_channels::{
        ChannelOutbound, DispatchConfig, DispatchOutcome, DispatchReport, DispatchRequest,
        StreamDispatcher, StreamEvent, StreamSender,
    },
    tether_common::{ChannelId, UserId},
    tether_config::BotConfig,
    tether_context::{
        ChainResolver, IdentityPolicy, MessageCache, MessageRef, Node, RawMessage,
        RequestBuilder, ResolveOptions,
    },
    tether_providers::{ChatMessage, LlmProvider, ModelCapabilities},
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::error::Result;

/// Bound of the provider → dispatcher channel.
const STREAM_BUFFER: usize = 64;

/// Generations sharing a key supersede each other: one reply in flight per
/// author and channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetKey {
    pub channel_id: ChannelId,
    pub author_id: UserId,
}

impl TargetKey {
    #[must_use]
    pub fn for_trigger(trigger: &RawMessage) -> Self {
        Self {
            channel_id: trigger.channel_id.clone(),
            author_id: trigger.author_id.clone(),
        }
    }
}

/// Everything about a bot the runtime reads, fixed at startup.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub bot_name: String,
    pub system_prompt: String,
    pub resolve: ResolveOptions,
    pub identity: IdentityPolicy,
    pub dispatch: DispatchConfig,
}

impl RuntimeSettings {
    #[must_use]
    pub fn from_bot(bot: &BotConfig, bot_id: UserId) -> Self {
        let caps = ModelCapabilities::for_bot(bot);
        Self {
            bot_name: bot.name.clone(),
            system_prompt: bot.system_prompt.clone(),
            resolve: ResolveOptions {
                mode: bot.context_mode,
                limits: bot.limits,
                vision: caps.vision,
            },
            identity: IdentityPolicy {
                names: caps.names,
                vision: caps.vision,
                bot_id,
            },
            dispatch: DispatchConfig {
                edit_interval: Duration::from_millis(bot.streaming.edit_interval_ms),
                model_timeout: Duration::from_secs(bot.streaming.model_timeout_secs),
            },
        }
    }
}

struct InFlight {
    generation: u64,
    cancel: CancellationToken,
}

pub struct ChatRuntime {
    settings: RuntimeSettings,
    resolver: ChainResolver,
    builder: RequestBuilder,
    provider: Arc<dyn LlmProvider>,
    outbound: Arc<dyn ChannelOutbound>,
    in_flight: Mutex<HashMap<TargetKey, InFlight>>,
    generations: AtomicU64,
}

impl ChatRuntime {
    pub fn new(
        settings: RuntimeSettings,
        resolver: ChainResolver,
        provider: Arc<dyn LlmProvider>,
        outbound: Arc<dyn ChannelOutbound>,
    ) -> Self {
        let builder = RequestBuilder::new(settings.system_prompt.clone());
        Self {
            settings,
            resolver,
            builder,
            provider,
            outbound,
            in_flight: Mutex::new(HashMap::new()),
            generations: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    /// The bot's message cache, for invalidation on platform edits/deletes.
    #[must_use]
    pub fn cache(&self) -> &Arc<MessageCache> {
        self.resolver.cache()
    }

    /// Number of generations currently streaming.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Answer one trigger message. Returns the dispatch report; delivery
    /// failures are returned as errors.
    pub async fn handle_trigger(&self, trigger: RawMessage) -> Result<DispatchReport> {
        let key = TargetKey::for_trigger(&trigger);
        let (generation, cancel) = self.register(&key);

        let result = self.generate(&trigger, cancel).await;
        self.release(&key, generation);

        match &result {
            Ok(report) => {
                info!(
                    bot = %self.settings.bot_name,
                    trigger = %trigger.id,
                    outcome = ?report.outcome,
                    messages = report.outputs.len(),
                    "generation finished"
                );
            },
            Err(e) => {
                warn!(
                    bot = %self.settings.bot_name,
                    trigger = %trigger.id,
                    error = %e,
                    "generation aborted"
                );
            },
        }
        result
    }

    async fn generate(
        &self,
        trigger: &RawMessage,
        cancel: CancellationToken,
    ) -> Result<DispatchReport> {
        if let Err(e) = self.outbound.send_typing(&trigger.channel_id).await {
            debug!(error = %e, "typing indicator failed");
        }

        let resolved = self.resolver.resolve(trigger, &self.settings.resolve).await;
        let messages = self.builder.build(&resolved, &self.settings.identity);
        let notices =
            resolved.warning_lines(&self.settings.resolve.limits, self.settings.resolve.vision);
        debug!(
            bot = %self.settings.bot_name,
            provider = self.provider.name(),
            model = self.provider.id(),
            messages = messages.len(),
            notices = notices.len(),
            "starting generation"
        );

        if cancel.is_cancelled() {
            return Ok(DispatchReport {
                outcome: DispatchOutcome::Superseded,
                outputs: Vec::new(),
            });
        }

        let (tx, rx) = tokio::sync::mpsc::channel(STREAM_BUFFER);
        let forwarder = tokio::spawn(forward_stream(
            Arc::clone(&self.provider),
            messages,
            tx,
            self.settings.bot_name.clone(),
        ));

        let request = DispatchRequest {
            channel_id: trigger.channel_id.clone(),
            trigger_id: trigger.id.clone(),
            notices,
        };
        let report = StreamDispatcher::new(self.outbound.as_ref(), self.settings.dispatch)
            .run(request, rx, cancel)
            .await;
        // Drops the HTTP request if the model is still producing.
        forwarder.abort();

        let report = report?;
        self.remember_outputs(trigger, &report);
        Ok(report)
    }

    /// Cache the bot's own messages so later replies to them resolve
    /// without a fetch. Each output replies to the one before it.
    fn remember_outputs(&self, trigger: &RawMessage, report: &DispatchReport) {
        let mut parent = trigger.id.clone();
        for output in &report.outputs {
            let node = Node::own_output(
                output.id.clone(),
                trigger.channel_id.clone(),
                self.settings.identity.bot_id.clone(),
                output.text.clone(),
                Some(MessageRef::new(trigger.channel_id.clone(), parent)),
                Utc::now(),
            );
            self.cache().insert(node);
            parent = output.id.clone();
        }
    }

    fn register(&self, key: &TargetKey) -> (u64, CancellationToken) {
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let previous = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone(), InFlight {
                generation,
                cancel: cancel.clone(),
            });
        if let Some(previous) = previous {
            debug!(
                bot = %self.settings.bot_name,
                channel = %key.channel_id,
                "superseding in-flight generation"
            );
            previous.cancel.cancel();
        }
        (generation, cancel)
    }

    /// Forget the token unless a newer generation already replaced it.
    fn release(&self, key: &TargetKey, generation: u64) {
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if in_flight
            .get(key)
            .is_some_and(|entry| entry.generation == generation)
        {
            in_flight.remove(key);
        }
    }
}

/// Pump provider events into the dispatcher channel until either side ends.
async fn forward_stream(
    provider: Arc<dyn LlmProvider>,
    messages: Vec<ChatMessage>,
    tx: StreamSender,
    bot_name: String,
) {
    let mut stream = provider.stream(messages);
    while let Some(event) = stream.next().await {
        let event = match event {
            tether_providers::StreamEvent::Delta(text) => StreamEvent::Delta(text),
            tether_providers::StreamEvent::Done(usage) => {
                info!(
                    bot = %bot_name,
                    model = provider.id(),
                    input_tokens = usage.input_tokens,
                    output_tokens = usage.output_tokens,
                    "model stream complete"
                );
                StreamEvent::Done
            },
            tether_providers::StreamEvent::Error(message) => StreamEvent::Error(message),
        };
        let last = !matches!(event, StreamEvent::Delta(_));
        if tx.send(event).await.is_err() || last {
            break;
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use {
        super::*,
        async_trait::async_trait,
        chrono::{DateTime, Utc},
        tether_channels::{OutputState, OutputTarget},
        tether_common::MessageId,
        tether_config::LimitsConfig,
        tether_context::{ContentExtractor, MessageSource, ResourceFetcher},
        tether_providers::{EventStream, Usage},
    };

    // ── Fakes ───────────────────────────────────────────────────────────────

    struct NoResources;

    #[async_trait]
    impl ResourceFetcher for NoResources {
        async fn fetch_text(&self, _url: &str) -> tether_context::Result<Option<String>> {
            Ok(None)
        }

        async fn fetch_bytes(&self, _url: &str) -> tether_context::Result<Option<Vec<u8>>> {
            Ok(None)
        }
    }

    #[derive(Default)]
    struct FakeSource {
        messages: Mutex<HashMap<MessageId, RawMessage>>,
    }

    #[async_trait]
    impl MessageSource for FakeSource {
        async fn fetch_message(&self, at: &MessageRef) -> tether_context::Result<Option<RawMessage>> {
            Ok(self.messages.lock().unwrap().get(&at.message_id).cloned())
        }

        async fn fetch_channel_window(
            &self,
            _channel: &ChannelId,
            _before: &MessageId,
            _limit: usize,
        ) -> tether_context::Result<Vec<RawMessage>> {
            Ok(Vec::new())
        }
    }

    /// Replies with `chunks`, pausing `gap` before each one.
    struct FakeProvider {
        chunks: Vec<String>,
        gap: Duration,
        fail: Option<String>,
        requests: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl FakeProvider {
        fn new(chunks: &[&str], gap: Duration) -> Self {
            Self {
                chunks: chunks.iter().map(|c| c.to_string()).collect(),
                gap,
                fail: None,
                requests: Mutex::default(),
            }
        }
    }

    impl LlmProvider for FakeProvider {
        fn name(&self) -> &str {
            "fake"
        }

        fn id(&self) -> &str {
            "fake-model"
        }

        fn stream(&self, messages: Vec<ChatMessage>) -> EventStream<'_> {
            self.requests.lock().unwrap().push(messages);
            let chunks = self.chunks.clone();
            let gap = self.gap;
            let fail = self.fail.clone();
            Box::pin(async_stream::stream! {
                for chunk in chunks {
                    tokio::time::sleep(gap).await;
                    yield tether_providers::StreamEvent::Delta(chunk);
                }
                match fail {
                    Some(message) => yield tether_providers::StreamEvent::Error(message),
                    None => yield tether_providers::StreamEvent::Done(Usage::default()),
                }
            })
        }
    }

    #[derive(Default)]
    struct FakeOutbound {
        sent: Mutex<Vec<(OutputTarget, String)>>,
        edits: Mutex<Vec<(MessageId, String, OutputState)>>,
        next_id: AtomicUsize,
    }

    impl FakeOutbound {
        fn final_states(&self) -> Vec<OutputState> {
            self.edits
                .lock()
                .unwrap()
                .iter()
                .map(|(_, _, state)| *state)
                .filter(|state| state.is_final())
                .collect()
        }
    }

    #[async_trait]
    impl ChannelOutbound for FakeOutbound {
        fn text_limit(&self, _notices: &[String]) -> usize {
            2_000
        }

        async fn send_message(
            &self,
            target: &OutputTarget,
            text: &str,
            _state: OutputState,
        ) -> tether_channels::Result<MessageId> {
            let n = self.next_id.fetch_add(1, Ordering::SeqCst);
            self.sent
                .lock()
                .unwrap()
                .push((target.clone(), text.to_string()));
            Ok(format!("bot-msg-{n}").into())
        }

        async fn edit_message(
            &self,
            _target: &OutputTarget,
            id: &MessageId,
            text: &str,
            state: OutputState,
        ) -> tether_channels::Result<()> {
            self.edits
                .lock()
                .unwrap()
                .push((id.clone(), text.to_string(), state));
            Ok(())
        }
    }

    fn at(i: i64) -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH + chrono::Duration::seconds(i)
    }

    fn raw(id: &str, author: &str, text: &str, parent: Option<&str>) -> RawMessage {
        RawMessage {
            id: id.into(),
            channel_id: "chan".into(),
            author_id: author.into(),
            is_self: false,
            text: text.into(),
            attachments: Vec::new(),
            parent: parent.map(|p| MessageRef::new("chan", p)),
            created_at: at(id.len() as i64),
        }
    }

    fn settings(limits: LimitsConfig) -> RuntimeSettings {
        let bot = BotConfig {
            name: "test".into(),
            model: "openai/gpt-4o".into(),
            system_prompt: String::new(),
            limits,
            ..Default::default()
        };
        RuntimeSettings::from_bot(&bot, "bot".into())
    }

    fn runtime(
        limits: LimitsConfig,
        source: FakeSource,
        provider: Arc<FakeProvider>,
        outbound: Arc<FakeOutbound>,
    ) -> ChatRuntime {
        let resolver = ChainResolver::new(
            Arc::new(MessageCache::new(100)),
            Arc::new(source),
            ContentExtractor::new(Arc::new(NoResources)),
        );
        ChatRuntime::new(settings(limits), resolver, provider, outbound)
    }

    // ── Tests ───────────────────────────────────────────────────────────────

    #[test]
    fn settings_follow_model_capabilities() {
        let s = settings(LimitsConfig::default());
        assert!(s.resolve.vision);
        assert!(s.identity.names);
        assert_eq!(s.dispatch.edit_interval, Duration::from_millis(1_000));

        let local = BotConfig {
            model: "ollama/llama3".into(),
            ..Default::default()
        };
        let s = RuntimeSettings::from_bot(&local, "bot".into());
        assert!(!s.resolve.vision);
        assert!(!s.identity.names);
    }

    #[tokio::test(start_paused = true)]
    async fn answers_and_caches_own_output() {
        let provider = Arc::new(FakeProvider::new(&["Hello", " world"], Duration::from_millis(10)));
        let outbound = Arc::new(FakeOutbound::default());
        let rt = runtime(
            LimitsConfig::default(),
            FakeSource::default(),
            Arc::clone(&provider),
            Arc::clone(&outbound),
        );

        let report = rt
            .handle_trigger(raw("t1", "alice", "hi bot", None))
            .await
            .unwrap();

        assert_eq!(report.outcome, DispatchOutcome::Completed);
        assert_eq!(report.text(), "Hello world");
        assert_eq!(outbound.final_states(), vec![OutputState::Done]);
        assert_eq!(rt.in_flight(), 0);

        let requests = provider.requests.lock().unwrap();
        assert_eq!(requests[0], vec![ChatMessage::user("hi bot").with_name("alice")]);

        let cached = rt.cache().peek(&"bot-msg-0".into()).unwrap();
        assert!(cached.is_self);
        assert_eq!(cached.text, "Hello world");
        assert_eq!(cached.parent_id(), Some(&"t1".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn follow_up_resolves_bot_reply_from_cache() {
        let provider = Arc::new(FakeProvider::new(&["42"], Duration::from_millis(10)));
        let outbound = Arc::new(FakeOutbound::default());
        let source = FakeSource::default();
        let first = raw("t1", "alice", "question", None);
        source
            .messages
            .lock()
            .unwrap()
            .insert(first.id.clone(), first.clone());
        let rt = runtime(
            LimitsConfig::default(),
            source,
            Arc::clone(&provider),
            Arc::clone(&outbound),
        );

        rt.handle_trigger(first).await.unwrap();
        rt.handle_trigger(raw("t2", "alice", "why?", Some("bot-msg-0")))
            .await
            .unwrap();

        let requests = provider.requests.lock().unwrap();
        assert_eq!(requests[1], vec![
            ChatMessage::user("question").with_name("alice"),
            ChatMessage::assistant("42").with_name("bot"),
            ChatMessage::user("why?").with_name("alice"),
        ]);
    }

    #[tokio::test(start_paused = true)]
    async fn warnings_reach_first_message() {
        let provider = Arc::new(FakeProvider::new(&["ok"], Duration::from_millis(10)));
        let outbound = Arc::new(FakeOutbound::default());
        let source = FakeSource::default();
        let parent = raw("p1", "bob", "earlier", None);
        source
            .messages
            .lock()
            .unwrap()
            .insert(parent.id.clone(), parent);
        let limits = LimitsConfig {
            max_messages: 1,
            ..Default::default()
        };
        let rt = runtime(limits, source, provider, Arc::clone(&outbound));

        rt.handle_trigger(raw("t1", "alice", "now", Some("p1")))
            .await
            .unwrap();

        let sent = outbound.sent.lock().unwrap();
        assert_eq!(sent[0].0.notices, vec![
            "⚠️ Only using last 1 message".to_string()
        ]);
        assert_eq!(sent[0].0.reply_to, Some("t1".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn provider_error_is_reported() {
        let provider = Arc::new(FakeProvider {
            fail: Some("HTTP 500: down".into()),
            ..FakeProvider::new(&["par"], Duration::from_millis(10))
        });
        let outbound = Arc::new(FakeOutbound::default());
        let rt = runtime(
            LimitsConfig::default(),
            FakeSource::default(),
            provider,
            Arc::clone(&outbound),
        );

        let report = rt
            .handle_trigger(raw("t1", "alice", "hi", None))
            .await
            .unwrap();
        assert_eq!(
            report.outcome,
            DispatchOutcome::Errored("HTTP 500: down".into())
        );
        assert_eq!(outbound.final_states(), vec![OutputState::Errored]);
    }

    #[tokio::test(start_paused = true)]
    async fn newer_trigger_supersedes_same_author() {
        let provider = Arc::new(FakeProvider::new(
            &["a", "b", "c", "d"],
            Duration::from_millis(500),
        ));
        let outbound = Arc::new(FakeOutbound::default());
        let rt = Arc::new(runtime(
            LimitsConfig::default(),
            FakeSource::default(),
            provider,
            Arc::clone(&outbound),
        ));

        let first = {
            let rt = Arc::clone(&rt);
            tokio::spawn(async move { rt.handle_trigger(raw("t1", "alice", "one", None)).await })
        };
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(rt.in_flight(), 1);

        let second = rt
            .handle_trigger(raw("t2", "alice", "two", None))
            .await
            .unwrap();
        let first = first.await.unwrap().unwrap();

        assert_eq!(first.outcome, DispatchOutcome::Superseded);
        assert_eq!(second.outcome, DispatchOutcome::Completed);
        assert_eq!(second.text(), "abcd");
        // Only the second generation reached a final state.
        assert_eq!(outbound.final_states(), vec![OutputState::Done]);
        assert_eq!(rt.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn different_authors_run_side_by_side() {
        let provider = Arc::new(FakeProvider::new(&["x", "y"], Duration::from_millis(300)));
        let outbound = Arc::new(FakeOutbound::default());
        let rt = Arc::new(runtime(
            LimitsConfig::default(),
            FakeSource::default(),
            provider,
            Arc::clone(&outbound),
        ));

        let a = {
            let rt = Arc::clone(&rt);
            tokio::spawn(async move { rt.handle_trigger(raw("t1", "alice", "one", None)).await })
        };
        let b = {
            let rt = Arc::clone(&rt);
            tokio::spawn(async move { rt.handle_trigger(raw("t2", "bob", "two", None)).await })
        };

        assert_eq!(a.await.unwrap().unwrap().outcome, DispatchOutcome::Completed);
        assert_eq!(b.await.unwrap().unwrap().outcome, DispatchOutcome::Completed);
        assert_eq!(outbound.final_states().len(), 2);
    }
}
