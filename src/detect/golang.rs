//! Go command detection: `package main` entrypoint discovery across the
//! repository tree and build/run candidate construction.

use std::path::Path;

use crate::allowlist::AllowedCommands;

use super::{file_exists, pick_first_allowed};

pub(super) fn detect_go_commands(
    repo: &Path,
    allowed: &AllowedCommands,
) -> (String, String, String) {
    let mut prebuild = vec!["go mod download".to_string()];
    if file_exists(&repo.join("go.work")) {
        prebuild.insert(0, "go work sync".to_string());
    }

    let entrypoint = detect_go_entrypoint(repo);
    let mut build = vec!["go build ./...".to_string()];
    let mut run = vec!["go run .".to_string(), "go run main.go".to_string()];

    match entrypoint.as_deref() {
        Some(".") => {
            build.insert(0, "go build -o app .".to_string());
            run.insert(0, "./app".to_string());
        }
        Some(ep) if ep.starts_with("./cmd/") => {
            build.insert(0, format!("go build -o app {}", ep));
            run.splice(0..0, ["./app".to_string(), format!("go run {}", ep)]);
        }
        Some(ep) if ep.starts_with("./") => {
            build.insert(0, format!("go build -o app {}", ep));
            run.splice(0..0, ["./app".to_string(), format!("go run {}", ep)]);
        }
        _ => {}
    }

    (
        pick_first_allowed(&prebuild, &allowed.prebuild),
        pick_first_allowed(&build, &allowed.build),
        pick_first_allowed(&run, &allowed.run),
    )
}

/// Prefer conventional `cmd/` binaries, then the repo root, then the first
/// alphabetical discovery.
fn detect_go_entrypoint(repo: &Path) -> Option<String> {
    let entrypoints = discover_go_main_entrypoints(repo);
    if entrypoints.is_empty() {
        return None;
    }

    if let Some(ep) = entrypoints.iter().find(|ep| ep.starts_with("./cmd/")) {
        return Some(ep.clone());
    }
    if let Some(ep) = entrypoints.iter().find(|ep| ep.as_str() == ".") {
        return Some(ep.clone());
    }
    entrypoints.into_iter().next()
}

fn discover_go_main_entrypoints(repo: &Path) -> Vec<String> {
    let mut entrypoints = Vec::new();
    walk_for_mains(repo, repo, &mut entrypoints);
    entrypoints.sort_by_key(|ep| ep.to_lowercase());
    entrypoints.dedup();
    entrypoints
}

fn walk_for_mains(repo: &Path, dir: &Path, entrypoints: &mut Vec<String>) {
    const EXCLUDED_DIRS: &[&str] = &[".git", "vendor", "node_modules"];

    let Ok(read_dir) = std::fs::read_dir(dir) else {
        return;
    };

    for entry in read_dir.filter_map(|entry| entry.ok()) {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let name = name.trim();

        if path.is_dir() {
            if name.starts_with('.') || EXCLUDED_DIRS.contains(&name) {
                continue;
            }
            walk_for_mains(repo, &path, entrypoints);
            continue;
        }

        if !name.ends_with(".go") || name.ends_with("_test.go") {
            continue;
        }
        let Ok(text) = std::fs::read_to_string(&path) else {
            continue;
        };
        if !text.contains("package main") || !text.contains("func main(") {
            continue;
        }

        let parent = path.parent().unwrap_or(repo);
        let entrypoint = match parent.strip_prefix(repo) {
            Ok(rel) if rel.as_os_str().is_empty() => ".".to_string(),
            Ok(rel) => format!("./{}", rel.to_string_lossy().replace('\\', "/")),
            Err(_) => continue,
        };

        if !entrypoints.contains(&entrypoint) {
            entrypoints.push(entrypoint);
        }
    }
}
