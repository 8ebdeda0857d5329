//! Runtime auto-detection: identify the language runtime from repository
//! file markers and pick build/run commands that survive the allowlist.
//!
//! Discriminators run in a fixed priority order; the first match wins.
//! Every command the detector returns has passed `is_command_allowed` for
//! its stage, so nothing unvetted ever reaches a generated recipe.

pub mod dockerfile;

mod golang;
mod java;
mod node;
mod python;

use std::path::Path;
use std::str::FromStr;

use crate::allowlist::{is_command_allowed, AllowedCommands};
use crate::errors::DetectError;

/// Language runtimes the detector can identify.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Runtime {
    Bun,
    Node,
    Python,
    Go,
    Php,
    Java,
    Static,
    Unknown,
}

impl Runtime {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bun => "bun",
            Self::Node => "node",
            Self::Python => "python",
            Self::Go => "go",
            Self::Php => "php",
            Self::Java => "java",
            Self::Static => "static",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Runtime {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bun" => Ok(Self::Bun),
            "node" => Ok(Self::Node),
            "python" => Ok(Self::Python),
            "go" => Ok(Self::Go),
            "php" => Ok(Self::Php),
            "java" => Ok(Self::Java),
            "static" => Ok(Self::Static),
            "unknown" => Ok(Self::Unknown),
            _ => Err(format!("Invalid runtime: {}", s)),
        }
    }
}

/// The detector's full answer for one repository.
#[derive(Debug, Clone)]
pub struct Detection {
    pub runtime: Runtime,
    pub version: String,
    pub prebuild: String,
    pub build: String,
    pub run: String,
}

/// Detection plus the synthesized recipe, as stored on the job.
#[derive(Debug, Clone)]
pub struct AutoBuildConfig {
    pub runtime: Runtime,
    pub version: String,
    pub prebuild_command: String,
    pub build_command: String,
    pub run_command: String,
    pub dockerfile_content: String,
}

/// Identify the runtime and version from repository file markers.
/// Priority order is fixed; the first marker that matches wins.
pub fn detect_runtime(repo: &Path) -> (Runtime, String) {
    if file_exists(&repo.join("bun.lock")) {
        return (Runtime::Bun, "1.2".to_string());
    }
    if file_exists(&repo.join("package.json")) {
        return (Runtime::Node, "22".to_string());
    }
    if is_python_project(repo) {
        return (Runtime::Python, "3.9".to_string());
    }
    if file_exists(&repo.join("go.mod")) {
        return (Runtime::Go, "1.18".to_string());
    }
    if file_exists(&repo.join("composer.json")) {
        return (Runtime::Php, "8".to_string());
    }
    if file_exists(&repo.join("pom.xml"))
        || file_exists(&repo.join("build.gradle"))
        || file_exists(&repo.join("build.gradle.kts"))
    {
        return (Runtime::Java, "17".to_string());
    }
    if file_exists(&repo.join("index.html")) {
        return (Runtime::Static, "latest".to_string());
    }
    (Runtime::Unknown, String::new())
}

/// Pick the (prebuild, build, run) commands for the detected runtime.
/// Unselected slots return the empty string.
pub fn detect_commands(
    repo: &Path,
    runtime: Runtime,
    allowed: &AllowedCommands,
) -> (String, String, String) {
    match runtime {
        Runtime::Static => (String::new(), String::new(), String::new()),
        Runtime::Node => node::detect_node_commands(repo, allowed),
        Runtime::Bun => (
            pick_allowed("bun install", &allowed.prebuild),
            pick_allowed("bun run build", &allowed.build),
            pick_allowed("bun run start", &allowed.run),
        ),
        Runtime::Python => python::detect_python_commands(repo, allowed),
        Runtime::Go => golang::detect_go_commands(repo, allowed),
        Runtime::Java => java::detect_java_commands(repo, allowed),
        Runtime::Php | Runtime::Unknown => (String::new(), String::new(), String::new()),
    }
}

/// Run the full detection pipeline for one repository.
pub fn detect(repo: &Path, allowed: &AllowedCommands) -> Detection {
    let (runtime, version) = detect_runtime(repo);
    let (prebuild, build, run) = detect_commands(repo, runtime, allowed);
    Detection {
        runtime,
        version,
        prebuild,
        build,
        run,
    }
}

/// Detection plus recipe synthesis, without build-env wiring. The worker
/// regenerates the recipe with the resolved build-args and secrets; this
/// form serves job-creation pre-synthesis.
pub fn auto_detect_build_config(
    repo: &Path,
    allowed: &AllowedCommands,
) -> Result<AutoBuildConfig, DetectError> {
    let detection = detect(repo, allowed);
    let dockerfile_content = dockerfile::generate_dockerfile(
        detection.runtime,
        &detection.version,
        &detection.prebuild,
        &detection.build,
        &detection.run,
        &[],
        &[],
    )?;

    Ok(AutoBuildConfig {
        runtime: detection.runtime,
        version: detection.version,
        prebuild_command: detection.prebuild,
        build_command: detection.build,
        run_command: detection.run,
        dockerfile_content,
    })
}

pub(crate) fn file_exists(path: &Path) -> bool {
    path.exists()
}

/// Return `preferred` if allowed, else fall back to the first pattern in
/// the stage list (fixed-recipe runtimes only carry literal patterns).
pub(crate) fn pick_allowed(preferred: &str, allowed: &[String]) -> String {
    if is_command_allowed(preferred, allowed) {
        return preferred.to_string();
    }
    if let Some(first) = allowed.first() {
        return first.clone();
    }
    String::new()
}

/// First candidate that passes the allowlist, or the empty string.
pub(crate) fn pick_first_allowed(candidates: &[String], allowed: &[String]) -> String {
    for candidate in candidates {
        if is_command_allowed(candidate, allowed) {
            return candidate.clone();
        }
    }
    String::new()
}

fn is_python_project(repo: &Path) -> bool {
    file_exists(&repo.join("requirements.txt"))
        || file_exists(&repo.join("pyproject.toml"))
        || file_exists(&repo.join("setup.py"))
        || file_exists(&repo.join("Pipfile"))
}
