//! Conversation-context assembly.
//!
//! A trigger message is turned into model-ready turns in four steps:
//! - [`extract`]: one raw platform message → an immutable [`Node`]
//! - [`cache`]: bounded LRU of nodes with single-flight fetching
//! - [`resolver`]: reply chain or channel window → merged, size-bounded turns
//! - [`request`]: turns → provider chat messages

pub mod cache;
pub mod error;
pub mod extract;
pub mod node;
pub mod request;
pub mod resolver;
pub mod resource;

pub use {
    cache::MessageCache,
    error::{Error, Result},
    extract::ContentExtractor,
    node::{ImageRef, MessageRef, Node, RawAttachment, RawMessage, Warning, is_notice_line},
    request::{IdentityPolicy, RequestBuilder},
    resolver::{ChainResolver, MessageSource, ResolveOptions, ResolvedConversation, Turn},
    resource::{HttpResourceFetcher, ResourceFetcher},
};
