//! Per-bot orchestration of a generation: context resolution, the model
//! call and streaming delivery.

pub mod error;
pub mod runtime;

pub use {
    error::{Error, Result},
    runtime::{ChatRuntime, RuntimeSettings, TargetKey},
};
