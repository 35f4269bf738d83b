//! Discord adapter.
//!
//! Connects one bot account through serenity, filters inbound messages,
//! converts them for the context pipeline and renders streamed replies as
//! embeds or plain messages.

pub mod bot;
pub mod convert;
pub mod handler;
pub mod platform;
pub mod render;

pub use {bot::run_bot, handler::DiscordHandler, platform::DiscordPlatform};
