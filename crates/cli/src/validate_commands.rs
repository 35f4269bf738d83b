use std::path::Path;

use {
    anyhow::Result,
    tether_config::validate::{self, Severity, ValidationResult},
};

/// ANSI color codes.
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";
const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";

pub fn check(path: Option<&Path>, verbose: bool) -> Result<()> {
    let result = validate::validate(path);

    // Print which file we're checking
    if let Some(ref path) = result.config_path {
        eprintln!("Checking {}\n", path.display());
    } else {
        eprintln!("No config file found; checking defaults.\n");
    }

    for line in report_lines(&result, verbose) {
        eprintln!("{line}");
    }

    let errors = result.count(Severity::Error);
    if errors > 0 {
        std::process::exit(1);
    }
    Ok(())
}

fn report_lines(result: &ValidationResult, verbose: bool) -> Vec<String> {
    let mut lines: Vec<String> = result
        .diagnostics
        .iter()
        .filter(|d| verbose || d.severity != Severity::Info)
        .map(|d| {
            let (color, label) = match d.severity {
                Severity::Error => (RED, "error"),
                Severity::Warning => (YELLOW, "warning"),
                Severity::Info => (CYAN, "info"),
            };
            if d.path.is_empty() {
                format!("  {BOLD}{color}{label}{RESET} {}", d.message)
            } else {
                format!("  {BOLD}{color}{label}{RESET} {}: {}", d.path, d.message)
            }
        })
        .collect();

    if !lines.is_empty() {
        lines.push(String::new());
    }

    let errors = result.count(Severity::Error);
    let warnings = result.count(Severity::Warning);
    if errors == 0 && warnings == 0 {
        lines.push("No issues found.".into());
    } else {
        lines.push(format!("{errors} error(s), {warnings} warning(s)"));
    }
    lines
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, std::io::Write};

    fn validate_file(contents: &str) -> ValidationResult {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        validate::validate(Some(file.path()))
    }

    #[test]
    fn clean_config_reports_no_issues() {
        let result = validate_file(
            r#"
            [[bots]]
            bot_token = "abc"
            model = "openai/gpt-4o"
            "#,
        );
        let lines = report_lines(&result, false);
        assert_eq!(lines.last().map(String::as_str), Some("No issues found."));
    }

    #[test]
    fn errors_are_counted() {
        let result = validate_file(
            r#"
            [[bots]]
            bot_token = ""
            model = "gpt-4o"
            "#,
        );
        assert!(result.has_errors());
        let lines = report_lines(&result, false);
        assert!(lines.last().unwrap().contains("error(s)"));
        assert!(lines.iter().any(|l| l.contains("bots[0]")));
    }
}
