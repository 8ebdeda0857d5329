//! Process configuration: the optional `configs/env.json` seed file and
//! the resolved runtime settings.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const DEFAULT_PORT: u16 = 8781;
pub const DEFAULT_REGISTRY: &str = "localhost:5000";
pub const DEFAULT_MAX_CONCURRENT: usize = 3;
/// The reference retry policy is no retries.
pub const DEFAULT_MAX_RETRIES: i64 = 0;

const ENV_CONFIG_FILE: &str = "configs/env.json";

/// Keys recognized in `configs/env.json`; each non-empty value is exported
/// into the process environment before settings are resolved, so explicit
/// process env and the seed file end up reading the same way.
#[derive(Debug, Default, Serialize, Deserialize)]
struct EnvFileConfig {
    #[serde(rename = "REGISTRY_URL", default)]
    registry_url: String,
    #[serde(rename = "CALLBACK_URL", default)]
    callback_url: String,
    #[serde(rename = "PORT", default)]
    port: String,
    #[serde(rename = "BUILDKIT_CONTROL_NETWORK", default)]
    buildkit_control_network: String,
}

/// Resolved daemon settings shared across the server, dispatcher and
/// workers.
#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub registry_url: String,
    pub callback_url: String,
    pub control_network: String,
    pub db_path: PathBuf,
    pub log_dir: PathBuf,
    pub allowlist_path: PathBuf,
    pub max_concurrent: usize,
    pub max_retries: i64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            registry_url: DEFAULT_REGISTRY.to_string(),
            callback_url: String::new(),
            control_network: String::new(),
            db_path: PathBuf::from("./hubfly-builder.sqlite"),
            log_dir: PathBuf::from("./log"),
            allowlist_path: PathBuf::from("configs/allowed-commands.json"),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl Settings {
    /// Fill registry/callback/port/control-network from the process
    /// environment on top of the defaults.
    pub fn apply_env(mut self) -> Self {
        if let Ok(registry) = std::env::var("REGISTRY_URL") {
            if !registry.trim().is_empty() {
                self.registry_url = registry.trim().to_string();
            }
        }
        if let Ok(callback) = std::env::var("CALLBACK_URL") {
            self.callback_url = callback.trim().to_string();
        }
        if let Ok(port) = std::env::var("PORT") {
            match port.trim().parse::<u16>() {
                Ok(parsed) => self.port = parsed,
                Err(_) => {
                    if !port.trim().is_empty() {
                        warn!(port = %port, "ignoring unparseable PORT");
                    }
                }
            }
        }
        if let Ok(network) = std::env::var("BUILDKIT_CONTROL_NETWORK") {
            self.control_network = network.trim().to_string();
        }
        self
    }
}

/// Read `configs/env.json`, creating it with empty defaults when absent,
/// and export the recognized non-empty keys into the process environment.
pub fn load_or_init_env_config() -> Result<()> {
    load_or_init_env_config_at(Path::new(ENV_CONFIG_FILE))
}

pub fn load_or_init_env_config_at(path: &Path) -> Result<()> {
    if !path.exists() {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let defaults = serde_json::to_string_pretty(&EnvFileConfig::default())?;
        std::fs::write(path, defaults)
            .with_context(|| format!("failed to create default {}", path.display()))?;
        info!(path = %path.display(), "created default env config");
    }

    let data = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let config: EnvFileConfig = serde_json::from_str(&data)
        .with_context(|| format!("failed to parse {}", path.display()))?;

    for (key, value) in [
        ("REGISTRY_URL", &config.registry_url),
        ("CALLBACK_URL", &config.callback_url),
        ("PORT", &config.port),
        ("BUILDKIT_CONTROL_NETWORK", &config.buildkit_control_network),
    ] {
        if !value.trim().is_empty() {
            std::env::set_var(key, value.trim());
        }
    }

    Ok(())
}
