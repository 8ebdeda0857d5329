//! Command allowlist: exact and wildcard matching of build/run commands.
//!
//! Every command the auto-detector proposes must survive this filter before
//! it is ever embedded into a build recipe. Wildcard matching is
//! deliberately strict: a `*` only ever expands to a single token of safe
//! characters, so shell metacharacters and whitespace can never ride in
//! through a wildcard.

use std::path::Path;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// The three per-stage pattern lists loaded from the allowlist file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AllowedCommands {
    #[serde(default)]
    pub prebuild: Vec<String>,
    #[serde(default)]
    pub build: Vec<String>,
    #[serde(default)]
    pub run: Vec<String>,
}

impl AllowedCommands {
    /// Load the allowlist from a JSON file. A missing or malformed file is
    /// an error; startup treats it as fatal.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read allowlist file {}", path.display()))?;
        let cmds: AllowedCommands = serde_json::from_str(&data)
            .with_context(|| format!("failed to parse allowlist file {}", path.display()))?;
        Ok(cmds)
    }
}

/// Character class a `*` wildcard expands to: one or more safe token
/// characters, never whitespace or shell metacharacters.
const WILDCARD_CLASS: &str = "[A-Za-z0-9:._/\\-]+";

/// Returns true iff `cmd` (trimmed) exactly equals a trimmed pattern or
/// matches a wildcard pattern end-to-end. Empty commands and empty
/// patterns never match.
pub fn is_command_allowed(cmd: &str, allowed: &[String]) -> bool {
    let cmd = cmd.trim();
    if cmd.is_empty() {
        return false;
    }

    for pattern in allowed {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            continue;
        }
        if pattern == cmd {
            return true;
        }
        if pattern.contains('*') && wildcard_match(pattern, cmd) {
            return true;
        }
    }
    false
}

fn wildcard_match(pattern: &str, value: &str) -> bool {
    let mut built = String::from("^");
    let parts: Vec<&str> = pattern.split('*').collect();
    for (i, part) in parts.iter().enumerate() {
        built.push_str(&regex::escape(part));
        if i < parts.len() - 1 {
            built.push_str(WILDCARD_CLASS);
        }
    }
    built.push('$');

    Regex::new(&built)
        .map(|re| re.is_match(value))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patterns(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_exact_match() {
        let allowed = patterns(&["npm install", "npm run build"]);
        assert!(is_command_allowed("npm install", &allowed));
        assert!(!is_command_allowed("npm ci", &allowed));
    }

    #[test]
    fn test_exact_match_trims_whitespace() {
        let allowed = patterns(&["  npm install  "]);
        assert!(is_command_allowed("npm install", &allowed));
        assert!(is_command_allowed("  npm install", &allowed));
    }

    #[test]
    fn test_wildcard_match() {
        let allowed = patterns(&[
            "npm run *",
            "java -jar target/*.jar",
            "python -m *",
            "uvicorn *:app --host 0.0.0.0 --port ${PORT:-8000}",
        ]);
        assert!(is_command_allowed("npm run start:prod", &allowed));
        assert!(is_command_allowed("java -jar target/app.jar", &allowed));
        assert!(is_command_allowed("python -m myapp", &allowed));
        assert!(is_command_allowed(
            "uvicorn main:app --host 0.0.0.0 --port ${PORT:-8000}",
            &allowed
        ));
    }

    #[test]
    fn test_wildcard_rejects_unsafe_chars() {
        let allowed = patterns(&["npm run *"]);
        assert!(is_command_allowed("npm run build", &allowed));
        assert!(!is_command_allowed("npm run build;rm", &allowed));
        assert!(!is_command_allowed("npm run build -- --prod", &allowed));
        assert!(!is_command_allowed("npm run $(whoami)", &allowed));
    }

    #[test]
    fn test_wildcard_requires_nonempty_segment() {
        let allowed = patterns(&["npm run *"]);
        assert!(!is_command_allowed("npm run ", &allowed));
    }

    #[test]
    fn test_empty_command_never_matches() {
        let allowed = patterns(&["*"]);
        assert!(!is_command_allowed("", &allowed));
        assert!(!is_command_allowed("   ", &allowed));
    }

    #[test]
    fn test_empty_pattern_never_matches() {
        let allowed = patterns(&["", "  "]);
        assert!(!is_command_allowed("npm install", &allowed));
    }

    #[test]
    fn test_wildcard_is_anchored() {
        let allowed = patterns(&["go run *"]);
        assert!(!is_command_allowed("go run main.go && rm -rf /", &allowed));
        assert!(!is_command_allowed("sudo go run main.go", &allowed));
    }

    #[test]
    fn test_load_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(AllowedCommands::load(&dir.path().join("nope.json")).is_err());
    }

    #[test]
    fn test_load_parses_stage_lists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("allowed-commands.json");
        std::fs::write(
            &path,
            r#"{"prebuild": ["npm ci"], "build": ["npm run build"], "run": ["npm start"]}"#,
        )
        .unwrap();

        let allowed = AllowedCommands::load(&path).unwrap();
        assert_eq!(allowed.prebuild, vec!["npm ci"]);
        assert_eq!(allowed.build, vec!["npm run build"]);
        assert_eq!(allowed.run, vec!["npm start"]);
    }
}
