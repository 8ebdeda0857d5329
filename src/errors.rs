//! Typed error hierarchy for the builder daemon.
//!
//! Three top-level enums cover the three failure domains:
//! - `SessionError` — ephemeral BuildKit daemon lifecycle failures
//! - `DetectError` — runtime auto-detection and recipe generation failures
//! - `WorkerError` — per-job pipeline failures; `BuildFailed` is the typed
//!   variant the dispatcher keys its retry policy on

use thiserror::Error;

/// Errors from the ephemeral BuildKit session lifecycle.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("missing job id for ephemeral buildkit")]
    MissingJobId,

    #[error("missing user network for ephemeral buildkit")]
    MissingUserNetwork,

    #[error("docker network '{network}' not found or inaccessible: {source}")]
    NetworkNotFound {
        network: String,
        #[source]
        source: bollard::errors::Error,
    },

    #[error("could not auto-detect control network; set BUILDKIT_CONTROL_NETWORK: {0}")]
    ControlNetworkUndetectable(String),

    #[error("container '{container}' has no IP on network '{network}'")]
    MissingAddress { container: String, network: String },

    #[error("buildkit daemon at {addr} is not ready: {reason}")]
    NotReady { addr: String, reason: String },

    #[error("failed to connect container '{container}' to network '{network}': {source}")]
    NetworkConnect {
        container: String,
        network: String,
        #[source]
        source: bollard::errors::Error,
    },

    #[error(transparent)]
    Docker(#[from] bollard::errors::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors from runtime auto-detection and Dockerfile generation.
#[derive(Debug, Error)]
pub enum DetectError {
    #[error("unsupported runtime: {0}")]
    UnsupportedRuntime(String),
}

/// Errors from a single worker run.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The job was terminated and marked failed with the given reason.
    /// The dispatcher applies its retry policy only to this variant.
    #[error("build failed: {reason}")]
    BuildFailed { reason: String },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}
