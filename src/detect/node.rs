//! Node.js command detection: package-manager selection, script-based
//! build/run candidates, and the `node server.js` fallback.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::allowlist::AllowedCommands;

use super::{file_exists, pick_first_allowed};

#[derive(Debug, Default, Deserialize)]
struct NodePackageJson {
    #[serde(default)]
    scripts: HashMap<String, String>,
    #[serde(rename = "packageManager", default)]
    package_manager: String,
}

pub(super) fn detect_node_commands(
    repo: &Path,
    allowed: &AllowedCommands,
) -> (String, String, String) {
    let metadata = load_package_json(repo);
    let package_manager = detect_package_manager(repo, metadata.as_ref());
    let scripts = metadata.map(|m| m.scripts).unwrap_or_default();

    let prebuild = prebuild_candidates(repo, &package_manager);
    let build = build_candidates(&package_manager, &scripts);
    let run = run_candidates(&package_manager, &scripts);

    (
        pick_first_allowed(&prebuild, &allowed.prebuild),
        pick_first_allowed(&build, &allowed.build),
        pick_first_allowed(&run, &allowed.run),
    )
}

fn load_package_json(repo: &Path) -> Option<NodePackageJson> {
    let data = std::fs::read_to_string(repo.join("package.json")).ok()?;
    serde_json::from_str(&data).ok()
}

/// The explicit `packageManager` manifest field wins; lockfiles are the
/// fallback signal; npm is the default.
fn detect_package_manager(repo: &Path, metadata: Option<&NodePackageJson>) -> String {
    if let Some(metadata) = metadata {
        let pm = metadata.package_manager.trim().to_lowercase();
        if pm.starts_with("pnpm@") || pm == "pnpm" {
            return "pnpm".to_string();
        }
        if pm.starts_with("yarn@") || pm == "yarn" {
            return "yarn".to_string();
        }
        if pm.starts_with("npm@") || pm == "npm" {
            return "npm".to_string();
        }
    }

    if file_exists(&repo.join("pnpm-lock.yaml")) {
        return "pnpm".to_string();
    }
    if file_exists(&repo.join("yarn.lock")) {
        return "yarn".to_string();
    }
    if file_exists(&repo.join("package-lock.json")) || file_exists(&repo.join("npm-shrinkwrap.json"))
    {
        return "npm".to_string();
    }

    "npm".to_string()
}

fn prebuild_candidates(repo: &Path, package_manager: &str) -> Vec<String> {
    match package_manager {
        "pnpm" => vec!["pnpm install".to_string()],
        "yarn" => vec!["yarn install".to_string()],
        _ => {
            // `npm ci` only takes priority when a lockfile exists.
            if file_exists(&repo.join("package-lock.json"))
                || file_exists(&repo.join("npm-shrinkwrap.json"))
            {
                vec!["npm ci".to_string(), "npm install".to_string()]
            } else {
                vec!["npm install".to_string(), "npm ci".to_string()]
            }
        }
    }
}

fn build_candidates(package_manager: &str, scripts: &HashMap<String, String>) -> Vec<String> {
    let mut script_names: Vec<String> = Vec::new();

    let mut add_script = |name: &str, script_names: &mut Vec<String>| {
        if !has_script(scripts, name) {
            return;
        }
        if script_names.iter().any(|existing| existing == name) {
            return;
        }
        script_names.push(name.to_string());
    };

    add_script("build", &mut script_names);
    for name in sorted_script_names(scripts) {
        let lower = name.to_lowercase();
        if lower.starts_with("build:") || lower.contains(":build") {
            add_script(&name, &mut script_names);
        }
    }

    let mut candidates = Vec::new();
    for name in &script_names {
        candidates.extend(script_candidates(package_manager, name));
    }
    candidates
}

fn run_candidates(package_manager: &str, scripts: &HashMap<String, String>) -> Vec<String> {
    let mut candidates = Vec::new();
    let mut added: Vec<String> = Vec::new();

    let mut add_script = |name: &str, candidates: &mut Vec<String>, added: &mut Vec<String>| {
        if !has_script(scripts, name) {
            return;
        }
        if added.iter().any(|existing| existing == name) {
            return;
        }
        added.push(name.to_string());
        candidates.extend(script_candidates(package_manager, name));
    };

    for name in ["start", "serve", "preview", "dev"] {
        add_script(name, &mut candidates, &mut added);
    }

    for name in sorted_script_names(scripts) {
        let lower = name.to_lowercase();
        if lower.contains("start")
            || lower.contains("serve")
            || lower.contains("prod")
            || lower.contains("preview")
        {
            add_script(&name, &mut candidates, &mut added);
        }
    }

    if added.is_empty() {
        for name in sorted_script_names(scripts) {
            if is_utility_script(&name) {
                continue;
            }
            add_script(&name, &mut candidates, &mut added);
            break;
        }
    }

    candidates.push("node server.js".to_string());
    candidates
}

fn sorted_script_names(scripts: &HashMap<String, String>) -> Vec<String> {
    let mut names: Vec<String> = scripts
        .keys()
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect();
    names.sort_by_key(|name| name.to_lowercase());
    names
}

fn script_candidates(package_manager: &str, script: &str) -> Vec<String> {
    match package_manager {
        "pnpm" => vec![format!("pnpm run {}", script), format!("pnpm {}", script)],
        "yarn" => vec![format!("yarn {}", script), format!("yarn run {}", script)],
        _ => {
            if script == "start" {
                vec!["npm start".to_string(), "npm run start".to_string()]
            } else {
                vec![format!("npm run {}", script)]
            }
        }
    }
}

fn is_utility_script(name: &str) -> bool {
    let name = name.trim().to_lowercase();
    matches!(
        name.as_str(),
        "build"
            | "test"
            | "lint"
            | "typecheck"
            | "format"
            | "clean"
            | "prepare"
            | "preinstall"
            | "postinstall"
            | "install"
    ) || name.starts_with("build:")
        || name.starts_with("test:")
        || name.starts_with("lint:")
        || name.starts_with("typecheck:")
        || name.starts_with("format:")
        || name.starts_with("clean:")
}

fn has_script(scripts: &HashMap<String, String>, key: &str) -> bool {
    scripts
        .get(key)
        .map(|value| !value.trim().is_empty())
        .unwrap_or(false)
}
