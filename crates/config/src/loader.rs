use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::{env_subst::substitute_env, schema::TetherConfig};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &["tether.toml", "tether.yaml", "tether.yml", "tether.json"];

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> anyhow::Result<TetherConfig> {
    let value = load_config_value(path)?;
    Ok(serde_json::from_value(value)?)
}

/// Read a config file into a format-agnostic JSON tree, after env substitution.
pub fn load_config_value(path: &Path) -> anyhow::Result<serde_json::Value> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let raw = substitute_env(&raw);
    parse_config_value(&raw, path)
}

/// Load the explicit `path` when given, otherwise discover one.
///
/// An explicit path that fails to load is an error; a discovered one falls
/// back to defaults with a warning, like [`discover_and_load`].
pub fn load_from(path: Option<&Path>) -> anyhow::Result<TetherConfig> {
    match path {
        Some(path) => {
            debug!(path = %path.display(), "loading config");
            load_config(path)
        },
        None => Ok(discover_and_load()),
    }
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `./tether.{toml,yaml,yml,json}` (project-local)
/// 2. `~/.config/tether/tether.{toml,yaml,yml,json}` (user-global)
///
/// Returns `TetherConfig::default()` if no config file is found.
pub fn discover_and_load() -> TetherConfig {
    if let Some(path) = find_config_file() {
        debug!(path = %path.display(), "loading config");
        match load_config(&path) {
            Ok(cfg) => return cfg,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
            },
        }
    } else {
        debug!("no config file found, using defaults");
    }
    TetherConfig::default()
}

/// Find the first config file in standard locations.
pub(crate) fn find_config_file() -> Option<PathBuf> {
    CONFIG_FILENAMES
        .iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
        .or_else(|| {
            let dir = config_dir()?;
            CONFIG_FILENAMES
                .iter()
                .map(|name| dir.join(name))
                .find(|p| p.exists())
        })
}

/// Returns the user-global config directory (`~/.config/tether/`).
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "tether").map(|d| d.config_dir().to_path_buf())
}

pub(crate) fn parse_config_value(raw: &str, path: &Path) -> anyhow::Result<serde_json::Value> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => {
            let v: toml::Value = toml::from_str(raw)?;
            Ok(serde_json::to_value(v)?)
        },
        "yaml" | "yml" => {
            let v: serde_yaml::Value = serde_yaml::from_str(raw)?;
            Ok(serde_json::to_value(v)?)
        },
        "json" => Ok(serde_json::from_str(raw)?),
        _ => anyhow::bail!("unsupported config format: .{ext}"),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, crate::schema::ContextMode, secrecy::ExposeSecret, std::io::Write};

    fn write_config(name: &str, contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        (dir, path)
    }

    #[test]
    fn loads_toml() {
        let (_dir, path) = write_config(
            "tether.toml",
            "[[bots]]\nname = \"a\"\nbot_token = \"t\"\ncontext_mode = \"channel_window\"\n",
        );
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.bots.len(), 1);
        assert_eq!(cfg.bots[0].context_mode, ContextMode::ChannelWindow);
        assert_eq!(cfg.bots[0].bot_token.expose_secret(), "t");
    }

    #[test]
    fn loads_yaml() {
        let (_dir, path) = write_config(
            "tether.yaml",
            "bots:\n  - name: y\n    model: openai/gpt-4o-mini\n    limits:\n      max_text: 500\n",
        );
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.bots[0].name, "y");
        assert_eq!(cfg.bots[0].limits.max_text, 500);
    }

    #[test]
    fn loads_json() {
        let (_dir, path) = write_config("tether.json", r#"{"cache": {"capacity": 42}}"#);
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.cache.capacity, 42);
        assert!(cfg.bots.is_empty());
    }

    #[test]
    fn rejects_unknown_extension() {
        let (_dir, path) = write_config("tether.ini", "x=1");
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("unsupported config format"));
    }

    #[test]
    fn explicit_missing_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(load_from(Some(&missing)).is_err());
    }
}
