//! Shared identifiers and error helpers used across all tether crates.

pub mod error;
pub mod types;

pub use {
    error::FromMessage,
    types::{ChannelId, MessageId, UserId},
};
