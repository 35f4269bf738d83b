//! Platform-neutral channel plumbing.
//!
//! A platform adapter implements [`ChannelOutbound`]; the
//! [`StreamDispatcher`] drives it from a stream of model deltas, and
//! [`gating`] decides which inbound messages may trigger a reply.

pub mod dispatch;
pub mod error;
pub mod gating;
pub mod plugin;

pub use {
    dispatch::{
        DispatchConfig, DispatchOutcome, DispatchReport, DispatchRequest, OutputMessage,
        StreamDispatcher,
    },
    error::{Error, Result},
    gating::{Denied, InboundContext, check_access, is_allowed},
    plugin::{ChannelOutbound, OutputState, OutputTarget, StreamEvent, StreamReceiver, StreamSender},
};
