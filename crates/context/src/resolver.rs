//! Walking the reply graph (or a channel window) into ordered turns.

use std::{
    collections::{BTreeSet, HashSet, VecDeque},
    sync::Arc,
};

use {
    async_trait::async_trait,
    futures::future::join_all,
    tether_common::{ChannelId, MessageId, UserId},
    tether_config::{ContextMode, LimitsConfig},
    tracing::{debug, warn},
};

use crate::{
    cache::MessageCache,
    error::{Error, Result},
    extract::ContentExtractor,
    node::{ImageRef, MessageRef, Node, RawMessage, Warning},
};

/// Platform access needed to resolve context.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Fetch one message; `Ok(None)` when it does not exist.
    async fn fetch_message(&self, at: &MessageRef) -> Result<Option<RawMessage>>;

    /// Up to `limit` messages of `channel` older than `before`, in any order.
    async fn fetch_channel_window(
        &self,
        channel: &ChannelId,
        before: &MessageId,
        limit: usize,
    ) -> Result<Vec<RawMessage>>;
}

/// Per-bot resolution settings.
#[derive(Debug, Clone, Copy)]
pub struct ResolveOptions {
    pub mode: ContextMode,
    pub limits: LimitsConfig,
    /// The active model accepts images.
    pub vision: bool,
}

/// Consecutive messages of one author, merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub author_id: UserId,
    pub is_self: bool,
    pub text: String,
    pub images: Vec<ImageRef>,
    /// Ids of the merged messages, oldest first.
    pub message_ids: Vec<MessageId>,
}

impl Turn {
    #[must_use]
    pub fn from_node(node: &Node) -> Self {
        Self {
            author_id: node.author_id.clone(),
            is_self: node.is_self,
            text: node.text.clone(),
            images: node.images.clone(),
            message_ids: vec![node.id.clone()],
        }
    }

    fn same_speaker(&self, other: &Self) -> bool {
        self.author_id == other.author_id && self.is_self == other.is_self
    }

    /// Append a later turn of the same speaker. Empty texts add no separator,
    /// so merging is associative.
    pub fn absorb(&mut self, later: Turn) {
        match (self.text.is_empty(), later.text.is_empty()) {
            (_, true) => {},
            (true, false) => self.text = later.text,
            (false, false) => {
                self.text.push('\n');
                self.text.push_str(&later.text);
            },
        }
        self.images.extend(later.images);
        self.message_ids.extend(later.message_ids);
    }
}

/// Merge adjacent same-author nodes into turns, preserving order.
#[must_use]
pub fn merge_turns(nodes: &[Arc<Node>]) -> Vec<Turn> {
    let mut turns: Vec<Turn> = Vec::with_capacity(nodes.len());
    for node in nodes {
        let turn = Turn::from_node(node);
        match turns.last_mut() {
            Some(last) if last.same_speaker(&turn) => last.absorb(turn),
            _ => turns.push(turn),
        }
    }
    turns
}

/// Ordered turns (oldest first) plus every recovered problem.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedConversation {
    pub turns: Vec<Turn>,
    pub warnings: BTreeSet<Warning>,
}

impl ResolvedConversation {
    /// User-facing warning lines in stable order.
    #[must_use]
    pub fn warning_lines(&self, limits: &LimitsConfig, vision: bool) -> Vec<String> {
        self.warnings
            .iter()
            .map(|w| w.user_text(limits, vision))
            .collect()
    }
}

/// Resolves the conversation leading up to a trigger message.
pub struct ChainResolver {
    cache: Arc<MessageCache>,
    source: Arc<dyn MessageSource>,
    extractor: ContentExtractor,
}

impl ChainResolver {
    pub fn new(
        cache: Arc<MessageCache>,
        source: Arc<dyn MessageSource>,
        extractor: ContentExtractor,
    ) -> Self {
        Self {
            cache,
            source,
            extractor,
        }
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<MessageCache> {
        &self.cache
    }

    pub async fn resolve(&self, trigger: &RawMessage, opts: &ResolveOptions) -> ResolvedConversation {
        let mut warnings = BTreeSet::new();
        let trigger_node = self.node_from_raw(trigger, opts).await;

        let nodes = match opts.mode {
            ContextMode::ReplyChain => self.reply_chain(trigger_node, opts, &mut warnings).await,
            ContextMode::ChannelWindow => {
                self.channel_window(trigger_node, opts, &mut warnings)
                    .await
            },
        };

        for node in &nodes {
            warnings.extend(node.warnings.iter().copied());
        }

        let mut turns = merge_turns(&nodes);
        for turn in &mut turns {
            enforce_turn_limits(turn, &opts.limits, &mut warnings);
        }

        debug!(
            trigger = %trigger.id,
            nodes = nodes.len(),
            turns = turns.len(),
            warnings = ?warnings,
            "resolved conversation"
        );
        ResolvedConversation { turns, warnings }
    }

    async fn node_from_raw(&self, raw: &RawMessage, opts: &ResolveOptions) -> Arc<Node> {
        let cached = self
            .cache
            .get_or_fetch(&raw.id, || async {
                Ok(self.extractor.extract(raw, &opts.limits, opts.vision).await)
            })
            .await;
        match cached {
            Some(node) => node,
            None => Arc::new(self.extractor.extract(raw, &opts.limits, opts.vision).await),
        }
    }

    async fn node_at(&self, at: &MessageRef, opts: &ResolveOptions) -> Option<Arc<Node>> {
        self.cache
            .get_or_fetch(&at.message_id, || async {
                let raw = self
                    .source
                    .fetch_message(at)
                    .await?
                    .ok_or_else(|| Error::not_found(&at.message_id))?;
                Ok(self.extractor.extract(&raw, &opts.limits, opts.vision).await)
            })
            .await
    }

    async fn reply_chain(
        &self,
        trigger: Arc<Node>,
        opts: &ResolveOptions,
        warnings: &mut BTreeSet<Warning>,
    ) -> Vec<Arc<Node>> {
        let max = opts.limits.max_messages.max(1);
        let mut chain: VecDeque<Arc<Node>> = VecDeque::new();
        let mut visited: HashSet<MessageId> = HashSet::new();
        let mut current = trigger;

        loop {
            visited.insert(current.id.clone());
            let parent = current.parent.clone();
            chain.push_front(current);

            let Some(parent) = parent else {
                break;
            };
            if visited.contains(&parent.message_id) {
                debug!(id = %parent.message_id, "reply cycle detected, stopping");
                break;
            }
            if chain.len() >= max {
                warnings.insert(Warning::MessageLimit);
                break;
            }
            match self.node_at(&parent, opts).await {
                Some(node) => current = node,
                None => {
                    warnings.insert(Warning::FetchFailed);
                    break;
                },
            }
        }

        chain.into()
    }

    async fn channel_window(
        &self,
        trigger: Arc<Node>,
        opts: &ResolveOptions,
        warnings: &mut BTreeSet<Warning>,
    ) -> Vec<Arc<Node>> {
        let max = opts.limits.max_messages.max(1);
        let raws = match self
            .source
            .fetch_channel_window(&trigger.channel_id, &trigger.id, max + 1)
            .await
        {
            Ok(raws) => raws,
            Err(e) => {
                warn!(channel = %trigger.channel_id, error = %e, "channel window fetch failed");
                warnings.insert(Warning::FetchFailed);
                Vec::new()
            },
        };

        let mut seen: HashSet<MessageId> = HashSet::from([trigger.id.clone()]);
        let candidates: Vec<RawMessage> = raws
            .into_iter()
            .filter(|raw| raw.created_at <= trigger.created_at && seen.insert(raw.id.clone()))
            .collect();

        let mut nodes = join_all(candidates.iter().map(|raw| self.node_from_raw(raw, opts))).await;
        nodes.push(trigger);
        nodes.sort_by_key(|node| node.created_at);

        if nodes.len() > max {
            warnings.insert(Warning::MessageLimit);
            nodes.drain(..nodes.len() - max);
        }
        nodes
    }
}

fn enforce_turn_limits(turn: &mut Turn, limits: &LimitsConfig, warnings: &mut BTreeSet<Warning>) {
    if let Some((cut, _)) = turn.text.char_indices().nth(limits.max_text) {
        turn.text.truncate(cut);
        warnings.insert(Warning::TextLimit);
    }
    if turn.images.len() > limits.max_images {
        turn.images.truncate(limits.max_images);
        warnings.insert(Warning::ImageLimit);
    }
}
