use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a build job.
///
/// Transitions are monotonic toward a terminal state with two exceptions:
/// restart recovery (`claimed`/`building` → `pending` at process start)
/// and retry (`failed` → `pending` while the retry budget lasts).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Claimed,
    Building,
    Success,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Building => "building",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Canceled)
    }
}

impl Default for JobStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "claimed" => Ok(Self::Claimed),
            "building" => Ok(Self::Building),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

/// Whether an env key is surfaced at recipe-build time, at container run
/// time, or both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvScope {
    Build,
    Runtime,
    Both,
}

impl EnvScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::Runtime => "runtime",
            Self::Both => "both",
        }
    }

    pub fn includes_build(&self) -> bool {
        matches!(self, Self::Build | Self::Both)
    }
}

impl std::fmt::Display for EnvScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnvScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "build" => Ok(Self::Build),
            "runtime" => Ok(Self::Runtime),
            "both" => Ok(Self::Both),
            _ => Err(format!("Invalid env scope: {}", s)),
        }
    }
}

/// Caller-supplied classification override for a single env key.
/// `secret: None` means "keep the auto-detected flag".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<EnvScope>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<bool>,
}

/// One classified env key, preserved verbatim for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedEnvVar {
    pub key: String,
    pub scope: EnvScope,
    pub secret: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
}

/// Where the job's source comes from. Only git sources are supported.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceInfo {
    #[serde(default)]
    pub git_repository: String,
    #[serde(default)]
    pub commit_sha: String,
    #[serde(rename = "ref", default)]
    pub git_ref: String,
    /// Subdirectory within the repo used as the build context.
    #[serde(default)]
    pub working_dir: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default)]
    pub cpu: i64,
    #[serde(rename = "memoryMB", default)]
    pub memory_mb: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildConfig {
    #[serde(default)]
    pub is_auto_build: bool,
    #[serde(default)]
    pub runtime: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub prebuild_command: String,
    #[serde(default)]
    pub build_command: String,
    #[serde(default)]
    pub run_command: String,
    /// Docker network the built workload belongs to. Required.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub network: String,
    #[serde(default)]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub resource_limits: ResourceLimits,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env_overrides: HashMap<String, EnvOverride>,
    /// Written by the env planner before the build starts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resolved_env_plan: Vec<ResolvedEnvVar>,
    /// Written when the recipe is synthesized by the auto-detector.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dockerfile_content: String,
}

/// The persisted build job entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildJob {
    pub id: String,
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub source_type: String,
    #[serde(default)]
    pub source_info: SourceInfo,
    /// Backward-compatible top-level env input; carried into
    /// `build_config.env` by the worker when the latter is empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
    #[serde(default)]
    pub build_config: BuildConfig,
    #[serde(default)]
    pub status: JobStatus,
    #[serde(default)]
    pub image_tag: String,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exit_code: Option<i64>,
    #[serde(default)]
    pub retry_count: i64,
    #[serde(default)]
    pub log_path: String,
    #[serde(default)]
    pub last_checkpoint: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}
