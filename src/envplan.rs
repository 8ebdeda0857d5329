//! Environment planner: classifies caller-supplied env keys into
//! build-args, build-secrets, and runtime-only variables.
//!
//! Classification combines auto-detection heuristics (public prefixes,
//! Dockerfile and build-config references, runtime signals, secret
//! markers) with explicit per-key overrides. The output is deterministic:
//! entries are sorted by key and the build-arg/secret partitions are
//! disjoint by construction.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use crate::store::models::{EnvOverride, EnvScope, ResolvedEnvVar};

/// Hint files larger than this are ignored rather than scanned.
const MAX_HINT_FILE_SIZE: u64 = 1 << 20; // 1 MiB

const PUBLIC_ENV_PREFIXES: &[&str] = &[
    "NEXT_PUBLIC_",
    "VITE_",
    "REACT_APP_",
    "NUXT_PUBLIC_",
    "PUBLIC_",
    "EXPO_PUBLIC_",
    "GATSBY_",
    "SVELTEKIT_PUBLIC_",
];

const RUNTIME_PREFERRED_KEYS: &[&str] = &[
    "DATABASE_URL",
    "REDIS_URL",
    "MONGODB_URI",
    "PORT",
    "NODE_ENV",
    "HOST",
    "TZ",
    "LOG_LEVEL",
];

const RUNTIME_PREFERRED_PREFIXES: &[&str] = &[
    "DB_", "DATABASE_", "REDIS_", "POSTGRES_", "PG_", "MYSQL_", "MONGO_", "JWT_", "SESSION_",
    "COOKIE_", "SMTP_", "MAIL_",
];

const NON_SECRET_KEYS: &[&str] = &["PORT", "NODE_ENV", "HOST", "TZ", "APP_ENV", "LOG_LEVEL"];

const SECRET_MARKERS: &[&str] = &[
    "SECRET",
    "TOKEN",
    "PASSWORD",
    "PRIVATE_KEY",
    "API_KEY",
    "ACCESS_KEY",
    "CREDENTIAL",
    "AUTH",
    "CERT",
    "DATABASE_URL",
    "REDIS_URL",
    "CONNECTION_STRING",
];

/// Build-config files scanned for literal key references.
const BUILD_HINT_FILES: &[&str] = &[
    "package.json",
    "bunfig.toml",
    "vite.config.js",
    "vite.config.ts",
    "vite.config.mjs",
    "vite.config.cjs",
    "next.config.js",
    "next.config.ts",
    "next.config.mjs",
    "nuxt.config.js",
    "nuxt.config.ts",
    "webpack.config.js",
    "webpack.config.ts",
    "rollup.config.js",
    "rollup.config.ts",
    "rollup.config.mjs",
    "astro.config.mjs",
    "astro.config.ts",
    "svelte.config.js",
    "svelte.config.ts",
];

/// The resolved plan for one job's env mapping.
#[derive(Debug, Clone, Default)]
pub struct EnvPlan {
    /// Non-secret keys surfaced to the build (scope build|both).
    pub build_args: BTreeMap<String, String>,
    /// Secret keys surfaced to the build via secret mounts.
    pub build_secrets: BTreeMap<String, String>,
    /// Every classified key, sorted by key.
    pub entries: Vec<ResolvedEnvVar>,
}

impl EnvPlan {
    pub fn build_arg_keys(&self) -> Vec<String> {
        self.build_args.keys().cloned().collect()
    }

    pub fn build_secret_keys(&self) -> Vec<String> {
        self.build_secrets.keys().cloned().collect()
    }
}

/// Classify every key of `env` against the build context and overrides.
pub fn resolve(
    build_context: &Path,
    env: &HashMap<String, String>,
    overrides: &HashMap<String, EnvOverride>,
) -> EnvPlan {
    if env.is_empty() {
        return EnvPlan::default();
    }

    let hints = collect_build_hints(build_context);

    // Trim keys and drop empties; BTreeMap gives the deterministic order.
    let mut normalized: BTreeMap<String, String> = BTreeMap::new();
    for (key, value) in env {
        let trimmed = key.trim();
        if trimmed.is_empty() {
            continue;
        }
        normalized.insert(trimmed.to_string(), value.clone());
    }

    let mut plan = EnvPlan::default();

    for (key, value) in &normalized {
        let upper = key.to_uppercase();
        let (mut scope, mut reason) = classify_scope(&upper, &hints);
        let mut secret = classify_secret(&upper);
        if reason.starts_with("dockerfile-arg") {
            // A Dockerfile ARG declaration is an explicit request for a
            // build-arg value.
            secret = false;
        }

        if let Some(ov) = overrides.get(key) {
            if let Some(forced_scope) = ov.scope {
                scope = forced_scope;
                reason.push_str("+override-scope");
            }
            if let Some(forced_secret) = ov.secret {
                secret = forced_secret;
                reason.push_str("+override-secret");
            }
        }

        plan.entries.push(ResolvedEnvVar {
            key: key.clone(),
            scope,
            secret,
            reason,
        });

        if scope.includes_build() {
            if secret {
                plan.build_secrets.insert(key.clone(), value.clone());
            } else {
                plan.build_args.insert(key.clone(), value.clone());
            }
        }
    }

    plan
}

struct BuildHints {
    dockerfile_content: String,
    config_contents: Vec<String>,
}

fn collect_build_hints(build_context: &Path) -> BuildHints {
    let dockerfile_content = read_upper_file(&build_context.join("Dockerfile"));

    let mut config_contents = Vec::new();
    for file_name in BUILD_HINT_FILES {
        let content = read_upper_file(&build_context.join(file_name));
        if !content.is_empty() {
            config_contents.push(content);
        }
    }

    BuildHints {
        dockerfile_content,
        config_contents,
    }
}

fn read_upper_file(path: &Path) -> String {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() && meta.len() <= MAX_HINT_FILE_SIZE => {}
        _ => return String::new(),
    }
    std::fs::read_to_string(path)
        .map(|s| s.to_uppercase())
        .unwrap_or_default()
}

fn classify_scope(key: &str, hints: &BuildHints) -> (EnvScope, String) {
    if has_any_prefix(key, PUBLIC_ENV_PREFIXES) {
        return (EnvScope::Both, "public-prefix".to_string());
    }

    if let Some(reason) = build_reference_reason(key, hints) {
        if is_runtime_preferred(key) {
            return (EnvScope::Both, format!("{}+runtime-signal", reason));
        }
        return (EnvScope::Build, reason);
    }

    if is_runtime_preferred(key) {
        return (EnvScope::Runtime, "runtime-signal".to_string());
    }

    (EnvScope::Runtime, "default-runtime".to_string())
}

fn build_reference_reason(key: &str, hints: &BuildHints) -> Option<String> {
    if !hints.dockerfile_content.is_empty() {
        if has_dockerfile_arg(&hints.dockerfile_content, key) {
            return Some("dockerfile-arg".to_string());
        }
        if hints.dockerfile_content.contains(&format!("${}", key))
            || hints.dockerfile_content.contains(&format!("${{{}}}", key))
        {
            return Some("dockerfile-reference".to_string());
        }
    }

    for content in &hints.config_contents {
        if content.contains(key) {
            return Some("build-config-reference".to_string());
        }
    }

    None
}

fn classify_secret(key: &str) -> bool {
    if has_any_prefix(key, PUBLIC_ENV_PREFIXES) {
        return false;
    }
    if NON_SECRET_KEYS.contains(&key) {
        return false;
    }
    if SECRET_MARKERS.iter().any(|marker| key.contains(marker)) {
        return true;
    }

    // Unknown keys default to secret.
    true
}

fn is_runtime_preferred(key: &str) -> bool {
    RUNTIME_PREFERRED_KEYS.contains(&key) || has_any_prefix(key, RUNTIME_PREFERRED_PREFIXES)
}

fn has_any_prefix(key: &str, prefixes: &[&str]) -> bool {
    prefixes.iter().any(|prefix| key.starts_with(prefix))
}

fn has_dockerfile_arg(content: &str, key: &str) -> bool {
    for line in content.lines() {
        let line = line.trim();
        let Some(decl) = line.strip_prefix("ARG ") else {
            continue;
        };
        let decl = decl.trim();
        if decl == key || decl.starts_with(&format!("{}=", key)) {
            return true;
        }
    }
    false
}
