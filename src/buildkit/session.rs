//! Ephemeral per-job BuildKit daemon lifecycle.
//!
//! Each build gets its own privileged BuildKit container on the control
//! network, optionally joined to the caller's user network. The container
//! carries a stable label so orphans left behind by a crashed process can
//! be reaped at the next startup.

use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};

use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions,
};
use bollard::models::HostConfig;
use bollard::network::{ConnectNetworkOptions, InspectNetworkOptions};
use bollard::Docker;
use tracing::{debug, info, warn};

use crate::errors::SessionError;

const BUILDKIT_IMAGE: &str = "moby/buildkit:buildx-stable-1";
const BUILDKIT_PORT: &str = "1234";
const EPHEMERAL_LABEL_KEY: &str = "hubfly.builder.ephemeral";
const EPHEMERAL_LABEL_VALUE: &str = "true";
const CONTAINER_NAME_PREFIX: &str = "hubfly-buildkit-";
const DEFAULT_CONTROL_NETWORK: &str = "bridge";
const READINESS_TIMEOUT: Duration = Duration::from_secs(30);
const READINESS_POLL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct EphemeralOpts {
    pub job_id: String,
    pub user_network: String,
    /// Empty means auto-resolve: `bridge` outside a container, otherwise
    /// the first usable network of the current container.
    pub control_network: String,
}

/// A running per-job BuildKit daemon.
#[derive(Debug)]
pub struct EphemeralBuildKit {
    docker: Docker,
    pub container_name: String,
    pub addr: String,
    pub user_network: String,
    pub control_network: String,
}

impl EphemeralBuildKit {
    pub async fn start(docker: Docker, opts: EphemeralOpts) -> Result<Self, SessionError> {
        let job_id = opts.job_id.trim().to_string();
        if job_id.is_empty() {
            return Err(SessionError::MissingJobId);
        }
        let user_network = opts.user_network.trim().to_string();
        if user_network.is_empty() {
            return Err(SessionError::MissingUserNetwork);
        }

        let control_network = resolve_control_network(&docker, &opts.control_network).await?;

        ensure_network_exists(&docker, &control_network).await?;
        if user_network != control_network {
            ensure_network_exists(&docker, &user_network).await?;
        }

        let container_name = format!("{}{}", CONTAINER_NAME_PREFIX, sanitize_container_name(&job_id));
        force_remove_container(&docker, &container_name).await?;

        docker
            .create_container(
                Some(CreateContainerOptions {
                    name: container_name.as_str(),
                    platform: None,
                }),
                Config {
                    image: Some(BUILDKIT_IMAGE.to_string()),
                    cmd: Some(vec![
                        "--addr".to_string(),
                        format!("tcp://0.0.0.0:{}", BUILDKIT_PORT),
                    ]),
                    labels: Some(HashMap::from([(
                        EPHEMERAL_LABEL_KEY.to_string(),
                        EPHEMERAL_LABEL_VALUE.to_string(),
                    )])),
                    host_config: Some(HostConfig {
                        privileged: Some(true),
                        auto_remove: Some(true),
                        network_mode: Some(control_network.clone()),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            )
            .await?;
        docker
            .start_container(&container_name, None::<StartContainerOptions<String>>)
            .await?;

        let session = Self {
            docker: docker.clone(),
            container_name: container_name.clone(),
            addr: String::new(),
            user_network: user_network.clone(),
            control_network: control_network.clone(),
        };

        match session.finish_start(&docker).await {
            Ok(addr) => {
                debug!(container = %container_name, addr = %addr, "ephemeral buildkit ready");
                Ok(Self { addr, ..session })
            }
            Err(err) => {
                // Tear the half-started container down before surfacing
                // the original error.
                if let Err(stop_err) = session.stop().await {
                    warn!(
                        container = %container_name,
                        error = %stop_err,
                        "failed to clean up ephemeral buildkit after start error"
                    );
                }
                Err(err)
            }
        }
    }

    async fn finish_start(&self, docker: &Docker) -> Result<String, SessionError> {
        if self.user_network != self.control_network {
            let connect = docker
                .connect_network(
                    &self.user_network,
                    ConnectNetworkOptions {
                        container: self.container_name.clone(),
                        endpoint_config: Default::default(),
                    },
                )
                .await;
            if let Err(err) = connect {
                // Re-running against a half-cleaned state may find the
                // endpoint already attached; that is success.
                if !err.to_string().to_lowercase().contains("already exists") {
                    return Err(SessionError::NetworkConnect {
                        container: self.container_name.clone(),
                        network: self.user_network.clone(),
                        source: err,
                    });
                }
            }
        }

        let ip = container_ip(docker, &self.container_name, &self.control_network).await?;
        if ip.is_empty() {
            return Err(SessionError::MissingAddress {
                container: self.container_name.clone(),
                network: self.control_network.clone(),
            });
        }
        let addr = format!("tcp://{}:{}", ip, BUILDKIT_PORT);

        wait_for_ready(&addr).await?;
        Ok(addr)
    }

    /// Force-remove the daemon container. A missing container counts as
    /// success.
    pub async fn stop(&self) -> Result<(), SessionError> {
        force_remove_container(&self.docker, &self.container_name).await
    }
}

/// Remove every container carrying the ephemeral label. Run at process
/// start to reap daemons orphaned by a crash.
pub async fn reap_orphans(docker: &Docker) -> Result<usize, SessionError> {
    let filters = HashMap::from([(
        "label".to_string(),
        vec![format!("{}={}", EPHEMERAL_LABEL_KEY, EPHEMERAL_LABEL_VALUE)],
    )]);
    let containers = docker
        .list_containers(Some(ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        }))
        .await?;

    let mut reaped = 0;
    for container in containers {
        let Some(id) = container.id else { continue };
        force_remove_container(docker, &id).await?;
        reaped += 1;
    }
    if reaped > 0 {
        info!(count = reaped, "reaped orphaned ephemeral buildkit containers");
    }
    Ok(reaped)
}

async fn resolve_control_network(
    docker: &Docker,
    configured: &str,
) -> Result<String, SessionError> {
    let configured = configured.trim();
    if !configured.is_empty() {
        return Ok(configured.to_string());
    }

    if !running_in_container() {
        return Ok(DEFAULT_CONTROL_NETWORK.to_string());
    }

    let networks = detect_current_container_networks(docker)
        .await
        .map_err(|err| SessionError::ControlNetworkUndetectable(err.to_string()))?;
    if networks.is_empty() {
        return Err(SessionError::ControlNetworkUndetectable(
            "no container networks detected".to_string(),
        ));
    }

    for candidate in &networks {
        if candidate == "host" || candidate == "none" {
            continue;
        }
        return Ok(candidate.clone());
    }

    Err(SessionError::ControlNetworkUndetectable(format!(
        "detected only unsupported networks ({})",
        networks.join(",")
    )))
}

/// Inside a container, the hostname is the container id; inspecting it
/// yields the networks this process is attached to, sorted for a
/// deterministic pick.
async fn detect_current_container_networks(
    docker: &Docker,
) -> Result<Vec<String>, bollard::errors::Error> {
    let hostname = std::env::var("HOSTNAME").unwrap_or_default();
    let inspect = docker
        .inspect_container(&hostname, None::<InspectContainerOptions>)
        .await?;

    let mut names: Vec<String> = inspect
        .network_settings
        .and_then(|settings| settings.networks)
        .map(|networks| networks.into_keys().collect())
        .unwrap_or_default();
    names.sort();
    names.dedup();
    Ok(names)
}

async fn ensure_network_exists(docker: &Docker, name: &str) -> Result<(), SessionError> {
    docker
        .inspect_network(name, None::<InspectNetworkOptions<String>>)
        .await
        .map_err(|err| SessionError::NetworkNotFound {
            network: name.to_string(),
            source: err,
        })?;
    Ok(())
}

async fn container_ip(
    docker: &Docker,
    container_name: &str,
    network: &str,
) -> Result<String, SessionError> {
    let inspect = docker
        .inspect_container(container_name, None::<InspectContainerOptions>)
        .await?;
    let ip = inspect
        .network_settings
        .and_then(|settings| settings.networks)
        .and_then(|mut networks| networks.remove(network))
        .and_then(|endpoint| endpoint.ip_address)
        .unwrap_or_default();
    Ok(ip)
}

/// Poll the daemon with `buildctl debug workers` until it answers or the
/// deadline passes.
async fn wait_for_ready(addr: &str) -> Result<(), SessionError> {
    let deadline = Instant::now() + READINESS_TIMEOUT;
    let mut last_err = String::new();

    while Instant::now() < deadline {
        let status = tokio::process::Command::new("buildctl")
            .args(["--addr", addr, "debug", "workers"])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .await;
        match status {
            Ok(status) if status.success() => return Ok(()),
            Ok(status) => last_err = format!("buildctl exited with {}", status),
            Err(err) => last_err = err.to_string(),
        }
        tokio::time::sleep(READINESS_POLL).await;
    }

    if last_err.is_empty() {
        last_err = "timed out waiting for buildkit readiness".to_string();
    }
    Err(SessionError::NotReady {
        addr: addr.to_string(),
        reason: last_err,
    })
}

async fn force_remove_container(docker: &Docker, name: &str) -> Result<(), SessionError> {
    let result = docker
        .remove_container(
            name,
            Some(RemoveContainerOptions {
                force: true,
                ..Default::default()
            }),
        )
        .await;
    match result {
        Ok(()) => Ok(()),
        Err(err) if is_no_such_container(&err) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn is_no_such_container(err: &bollard::errors::Error) -> bool {
    if let bollard::errors::Error::DockerResponseServerError { status_code, .. } = err {
        if *status_code == 404 {
            return true;
        }
    }
    let text = err.to_string().to_lowercase();
    text.contains("no such container") || text.contains("no such object")
}

fn running_in_container() -> bool {
    Path::new("/.dockerenv").exists()
}

/// Derive a collide-safe container name fragment from a job id:
/// lowercase, unsafe characters collapsed to `-`, trimmed, capped at 48
/// bytes, with `job` as the degenerate fallback.
fn sanitize_container_name(value: &str) -> String {
    let value = value.trim().to_lowercase();
    if value.is_empty() {
        return "job".to_string();
    }

    let mapped: String = value
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '.' | '-' | '_' => c,
            _ => '-',
        })
        .collect();

    let mut result = mapped.trim_matches(|c| matches!(c, '-' | '_' | '.')).to_string();
    if result.is_empty() {
        return "job".to_string();
    }
    if result.len() > 48 {
        result.truncate(48);
    }
    result
}
