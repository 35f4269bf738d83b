//! Configuration validation engine.
//!
//! Validates configuration files against the known schema, detects
//! unknown/misspelled fields, and reports settings that would make a bot
//! unusable.

use std::{collections::HashMap, path::Path};

use crate::{
    loader::{find_config_file, parse_config_value},
    schema::TetherConfig,
};

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
            Self::Info => write!(f, "info"),
        }
    }
}

/// A single validation diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Category: "syntax", "unknown-field", "type-error", "model", "limits",
    /// "credentials", "file-ref"
    pub category: &'static str,
    /// Dotted path, e.g. "bots[0].limits.max_text"
    pub path: String,
    pub message: String,
}

/// Result of validating a configuration file.
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
    pub config_path: Option<std::path::PathBuf>,
}

impl ValidationResult {
    /// Returns `true` if any diagnostic is an error.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    /// Count diagnostics by severity.
    #[must_use]
    pub fn count(&self, severity: Severity) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }
}

// ── Schema tree for unknown-field detection ─────────────────────────────────

/// Expected shape of the configuration tree.
enum KnownKeys {
    /// A struct with fixed field names.
    Struct(HashMap<&'static str, KnownKeys>),
    /// A map with dynamic keys whose values have a known shape.
    Map(Box<KnownKeys>),
    /// An array of typed items.
    Array(Box<KnownKeys>),
    /// Scalar or free-form value; recursion stops here.
    Leaf,
}

/// Build the schema map mirroring every field in `schema.rs`.
fn build_schema_map() -> KnownKeys {
    use KnownKeys::{Array, Leaf, Map, Struct};

    let provider_entry = Struct(HashMap::from([("base_url", Leaf), ("api_key", Leaf)]));

    let limits = Struct(HashMap::from([
        ("max_text", Leaf),
        ("max_images", Leaf),
        ("max_messages", Leaf),
        ("max_links", Leaf),
        ("max_link_words", Leaf),
    ]));

    let streaming = Struct(HashMap::from([
        ("edit_interval_ms", Leaf),
        ("model_timeout_secs", Leaf),
    ]));

    let bot = Struct(HashMap::from([
        ("name", Leaf),
        ("bot_token", Leaf),
        ("model", Leaf),
        ("system_prompt", Leaf),
        ("status_message", Leaf),
        ("allowed_channel_ids", Leaf),
        ("allowed_role_ids", Leaf),
        ("mention_mode", Leaf),
        ("dm_policy", Leaf),
        ("context_mode", Leaf),
        ("use_plain_responses", Leaf),
        ("extra_api_parameters", Leaf),
        ("vision", Leaf),
        ("names", Leaf),
        ("limits", limits),
        ("streaming", streaming),
    ]));

    Struct(HashMap::from([
        ("providers", Map(Box::new(provider_entry))),
        ("bots", Array(Box::new(bot))),
        ("cache", Struct(HashMap::from([("capacity", Leaf)]))),
    ]))
}

// ── Levenshtein distance ────────────────────────────────────────────────────

/// Compute the Levenshtein edit distance between two strings.
fn levenshtein(a: &str, b: &str) -> usize {
    let b_chars: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b_chars.len()).collect();
    let mut curr = vec![0; b_chars.len() + 1];

    for (i, ca) in a.chars().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b_chars.iter().enumerate() {
            let cost = usize::from(ca != *cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b_chars.len()]
}

/// Closest candidate within `max_distance` edits, if any.
fn suggest<'a>(needle: &str, candidates: &[&'a str], max_distance: usize) -> Option<&'a str> {
    candidates
        .iter()
        .map(|c| (*c, levenshtein(needle, c)))
        .filter(|(_, d)| *d > 0 && *d <= max_distance)
        .min_by_key(|(_, d)| *d)
        .map(|(c, _)| c)
}

// ── Core validation ─────────────────────────────────────────────────────────

/// Validate a config file at the given path, or discover the default config
/// file location if `path` is `None`.
#[must_use]
pub fn validate(path: Option<&Path>) -> ValidationResult {
    let config_path = path.map(Path::to_path_buf).or_else(find_config_file);

    let Some(ref actual_path) = config_path else {
        return ValidationResult {
            diagnostics: vec![Diagnostic {
                severity: Severity::Info,
                category: "file-ref",
                path: String::new(),
                message: "no config file found; using defaults".into(),
            }],
            config_path: None,
        };
    };

    let diagnostics = match std::fs::read_to_string(actual_path) {
        Ok(content) => {
            let content = crate::env_subst::substitute_env(&content);
            match parse_config_value(&content, actual_path) {
                Ok(value) => validate_value(&value),
                Err(e) => vec![Diagnostic {
                    severity: Severity::Error,
                    category: "syntax",
                    path: String::new(),
                    message: format!("syntax error: {e}"),
                }],
            }
        },
        Err(e) => vec![Diagnostic {
            severity: Severity::Error,
            category: "file-ref",
            path: String::new(),
            message: format!("failed to read config file: {e}"),
        }],
    };

    ValidationResult {
        diagnostics,
        config_path,
    }
}

/// Validate a TOML string without file-system side effects.
#[must_use]
pub fn validate_toml_str(toml_str: &str) -> ValidationResult {
    let diagnostics = match toml::from_str::<toml::Value>(toml_str)
        .map_err(|e| e.to_string())
        .and_then(|v| serde_json::to_value(v).map_err(|e| e.to_string()))
    {
        Ok(value) => validate_value(&value),
        Err(e) => vec![Diagnostic {
            severity: Severity::Error,
            category: "syntax",
            path: String::new(),
            message: format!("TOML syntax error: {e}"),
        }],
    };
    ValidationResult {
        diagnostics,
        config_path: None,
    }
}

fn validate_value(value: &serde_json::Value) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();

    check_unknown_fields(value, &build_schema_map(), "", &mut diagnostics);

    match serde_json::from_value::<TetherConfig>(value.clone()) {
        Ok(config) => check_semantics(&config, &mut diagnostics),
        Err(e) => diagnostics.push(Diagnostic {
            severity: Severity::Error,
            category: "type-error",
            path: String::new(),
            message: format!("type error: {e}"),
        }),
    }

    diagnostics
}

/// Walk the value tree against the schema tree and flag unknown keys.
fn check_unknown_fields(
    value: &serde_json::Value,
    schema: &KnownKeys,
    prefix: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    let join = |key: &str| {
        if prefix.is_empty() {
            key.to_string()
        } else {
            format!("{prefix}.{key}")
        }
    };

    match (value, schema) {
        (serde_json::Value::Object(table), KnownKeys::Struct(fields)) => {
            let known_keys: Vec<&str> = fields.keys().copied().collect();
            for (key, child_value) in table {
                let path = join(key);
                if let Some(child_schema) = fields.get(key.as_str()) {
                    check_unknown_fields(child_value, child_schema, &path, diagnostics);
                    continue;
                }
                let message = match suggest(key, &known_keys, 3) {
                    Some(s) => format!("unknown field (did you mean \"{s}\"?)"),
                    None => "unknown field".to_string(),
                };
                diagnostics.push(Diagnostic {
                    severity: Severity::Error,
                    category: "unknown-field",
                    path,
                    message,
                });
            }
        },
        (serde_json::Value::Object(table), KnownKeys::Map(value_schema)) => {
            for (key, child_value) in table {
                check_unknown_fields(child_value, value_schema, &join(key), diagnostics);
            }
        },
        (serde_json::Value::Array(items), KnownKeys::Array(item_schema)) => {
            for (i, item) in items.iter().enumerate() {
                let path = format!("{prefix}[{i}]");
                check_unknown_fields(item, item_schema, &path, diagnostics);
            }
        },
        // Leaf or type mismatch; deserialization reports type errors.
        _ => {},
    }
}

/// Run semantic checks on a successfully parsed config.
fn check_semantics(config: &TetherConfig, diagnostics: &mut Vec<Diagnostic>) {
    if config.bots.is_empty() {
        diagnostics.push(Diagnostic {
            severity: Severity::Warning,
            category: "file-ref",
            path: "bots".into(),
            message: "no bots configured; nothing will run".into(),
        });
    }

    if config.cache.capacity == 0 {
        diagnostics.push(Diagnostic {
            severity: Severity::Error,
            category: "limits",
            path: "cache.capacity".into(),
            message: "cache capacity must be at least 1".into(),
        });
    }

    for (i, bot) in config.bots.iter().enumerate() {
        let at = |field: &str| format!("bots[{i}].{field}");

        if !bot.has_token() {
            diagnostics.push(Diagnostic {
                severity: Severity::Error,
                category: "credentials",
                path: at("bot_token"),
                message: "bot token is empty".into(),
            });
        }

        match bot.model_parts() {
            None => diagnostics.push(Diagnostic {
                severity: Severity::Error,
                category: "model",
                path: at("model"),
                message: format!("model \"{}\" is not in provider/model form", bot.model),
            }),
            Some((provider, _))
                if config.providers.get(provider).is_none()
                    && provider.eq_ignore_ascii_case("openai") =>
            {
                diagnostics.push(Diagnostic {
                    severity: Severity::Info,
                    category: "model",
                    path: at("model"),
                    message: "no [providers.openai]; using the public endpoint with OPENAI_API_KEY"
                        .into(),
                });
            },
            Some((provider, _)) if config.providers.get(provider).is_none() => {
                let names: Vec<&str> = config.providers.providers.keys().map(String::as_str).collect();
                let message = match suggest(provider, &names, 3) {
                    Some(s) => format!("provider \"{provider}\" is not configured (did you mean \"{s}\"?)"),
                    None => format!("provider \"{provider}\" is not configured under [providers]"),
                };
                diagnostics.push(Diagnostic {
                    severity: Severity::Error,
                    category: "model",
                    path: at("model"),
                    message,
                });
            },
            Some(_) => {},
        }

        for (field, value) in [
            ("limits.max_text", bot.limits.max_text),
            ("limits.max_messages", bot.limits.max_messages),
        ] {
            if value == 0 {
                diagnostics.push(Diagnostic {
                    severity: Severity::Error,
                    category: "limits",
                    path: at(field),
                    message: "must be at least 1".into(),
                });
            }
        }

        if bot.vision == Some(false) && bot.limits.max_images > 0 {
            diagnostics.push(Diagnostic {
                severity: Severity::Info,
                category: "limits",
                path: at("limits.max_images"),
                message: "vision is disabled for this bot; images will be ignored".into(),
            });
        }

        if bot.status_message.chars().count() > 128 {
            diagnostics.push(Diagnostic {
                severity: Severity::Warning,
                category: "limits",
                path: at("status_message"),
                message: "status message will be truncated to 128 characters".into(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"
        [providers.openai]
        api_key = "sk-test"

        [[bots]]
        name = "main"
        bot_token = "token"
        model = "openai/gpt-4o"
    "#;

    fn categories(result: &ValidationResult) -> Vec<(&'static str, String)> {
        result
            .diagnostics
            .iter()
            .map(|d| (d.category, d.path.clone()))
            .collect()
    }

    #[test]
    fn valid_config_has_no_diagnostics() {
        let result = validate_toml_str(VALID);
        assert!(result.diagnostics.is_empty(), "{:?}", result.diagnostics);
    }

    #[test]
    fn unknown_field_with_suggestion() {
        let result = validate_toml_str(&format!("{VALID}\nmax_mesages = 3\n"));
        let diag = result
            .diagnostics
            .iter()
            .find(|d| d.category == "unknown-field");
        assert!(diag.is_some_and(|d| d.path == "bots[0].max_mesages"));

        let result = validate_toml_str("[cache]\ncapacty = 3\n");
        assert!(
            result
                .diagnostics
                .iter()
                .any(|d| d.message.contains("did you mean \"capacity\""))
        );
    }

    #[test]
    fn model_without_provider_prefix() {
        let result = validate_toml_str("[[bots]]\nbot_token = \"t\"\nmodel = \"gpt-4o\"\n");
        assert!(result.has_errors());
        assert!(categories(&result).contains(&("model", "bots[0].model".into())));
    }

    #[test]
    fn unconfigured_provider_suggests_close_name() {
        let result = validate_toml_str(
            "[providers.openai]\n[[bots]]\nbot_token = \"t\"\nmodel = \"opnai/gpt-4o\"\n",
        );
        assert!(
            result
                .diagnostics
                .iter()
                .any(|d| d.message.contains("did you mean \"openai\""))
        );
    }

    #[test]
    fn openai_without_table_falls_back() {
        let result = validate_toml_str("[[bots]]\nbot_token = \"t\"\nmodel = \"openai/gpt-4o\"\n");
        assert!(!result.has_errors());
        assert_eq!(result.count(Severity::Info), 1);
    }

    #[test]
    fn empty_token_and_zero_limits_are_errors() {
        let result = validate_toml_str(
            "[providers.openai]\n[[bots]]\nmodel = \"openai/x\"\n[bots.limits]\nmax_text = 0\n",
        );
        assert_eq!(result.count(Severity::Error), 2);
        let cats = categories(&result);
        assert!(cats.contains(&("credentials", "bots[0].bot_token".into())));
        assert!(cats.contains(&("limits", "bots[0].limits.max_text".into())));
    }

    #[test]
    fn type_errors_are_reported() {
        let result = validate_toml_str("[cache]\ncapacity = \"lots\"\n");
        assert!(categories(&result).iter().any(|(c, _)| *c == "type-error"));
    }

    #[test]
    fn syntax_errors_stop_validation() {
        let result = validate_toml_str("[[bots]\n");
        assert_eq!(result.diagnostics.len(), 1);
        assert_eq!(result.diagnostics[0].category, "syntax");
    }

    #[test]
    fn no_bots_is_a_warning() {
        let result = validate_toml_str("");
        assert!(!result.has_errors());
        assert_eq!(result.count(Severity::Warning), 1);
    }

    #[test]
    fn levenshtein_counts_edits() {
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(suggest("modle", &["model", "name"], 3), Some("model"));
    }
}
