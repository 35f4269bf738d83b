//! Configuration loading, validation and env substitution.
//!
//! Config files: `tether.toml`, `tether.yaml`, or `tether.json`
//! Searched in `./` then `~/.config/tether/`.
//!
//! Supports `${ENV_VAR}` and `${ENV_VAR:-fallback}` substitution in the raw file.

pub mod env_subst;
pub mod loader;
pub mod schema;
pub mod validate;

pub use {
    loader::{config_dir, discover_and_load, load_config, load_from},
    schema::{
        BotConfig, CacheConfig, ContextMode, DmPolicy, LimitsConfig, MentionMode, ProviderEntry,
        ProvidersConfig, StreamingConfig, TetherConfig,
    },
    validate::{Diagnostic, Severity, ValidationResult},
};
