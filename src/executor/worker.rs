//! The per-job worker pipeline: workspace provisioning, checkout, env
//! planning, secret materialization, ephemeral daemon bring-up, the
//! BuildKit build itself, and completion reporting.
//!
//! Every resource the worker acquires (workspace, secret directory, log
//! file handle, daemon session) is released on all exit paths; the
//! tempdirs clean themselves up on drop and the session is stopped
//! explicitly after the build phase regardless of its outcome.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use bollard::Docker;
use chrono::{SecondsFormat, Utc};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{error, info};

use crate::allowlist::AllowedCommands;
use crate::buildkit::session::{EphemeralBuildKit, EphemeralOpts};
use crate::buildkit::{sanitize_command_for_log, BuildKit, BuildOpts, BuildSecret};
use crate::callback::CallbackClient;
use crate::config::Settings;
use crate::detect;
use crate::detect::dockerfile::generate_dockerfile;
use crate::envplan::{self, EnvPlan};
use crate::errors::WorkerError;
use crate::logs::{LogManager, COMPACT_UTC_FORMAT};
use crate::store::models::{BuildJob, JobStatus, ResolvedEnvVar};
use crate::store::DbHandle;

/// Everything a worker needs beyond the job itself. Cheap to clone; the
/// dispatcher hands a clone to every spawned worker task.
#[derive(Clone)]
pub struct WorkerDeps {
    pub db: DbHandle,
    pub logs: Arc<LogManager>,
    pub allowlist: Arc<AllowedCommands>,
    pub callback: Arc<CallbackClient>,
    pub docker: Docker,
    pub settings: Arc<Settings>,
}

/// Line-stamped writer feeding both the process stream and the job's log
/// file.
struct JobLogger {
    file: Mutex<File>,
}

impl JobLogger {
    fn new(file: File) -> Arc<Self> {
        Arc::new(Self {
            file: Mutex::new(file),
        })
    }

    fn log(&self, line: &str) {
        let stamped = format!(
            "[{}] {}",
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            line
        );
        println!("{}", stamped);
        if let Ok(mut file) = self.file.lock() {
            let _ = writeln!(file, "{}", stamped);
        }
    }
}

enum CommandOutcome {
    Completed(std::process::ExitStatus),
    TimedOut,
}

pub struct Worker {
    job: BuildJob,
    deps: WorkerDeps,
}

impl Worker {
    pub fn new(job: BuildJob, deps: WorkerDeps) -> Self {
        Self { job, deps }
    }

    /// Run the job to completion. Any pipeline failure marks the job
    /// `failed` with a short reason, reports it via the callback, and
    /// surfaces as `WorkerError::BuildFailed` so the dispatcher can apply
    /// its retry policy.
    pub async fn run(mut self) -> Result<(), WorkerError> {
        info!(job_id = %self.job.id, "starting build");
        self.job.started_at = Some(Utc::now());

        let (log_path, log_file) = match self.deps.logs.create_log_file(&self.job.id) {
            Ok(created) => created,
            Err(err) => {
                error!(job_id = %self.job.id, error = %err, "could not create log file");
                return Err(self.finish_failed("failed to create log file", None).await);
            }
        };
        self.job.log_path = log_path.to_string_lossy().into_owned();
        let logger = JobLogger::new(log_file);

        let job_id = self.job.id.clone();
        let stored_path = self.job.log_path.clone();
        if let Err(err) = self
            .deps
            .db
            .call(move |db| db.update_log_path(&job_id, &stored_path))
            .await
        {
            logger.log(&format!("ERROR: could not update log path: {}", err));
            return Err(self.finish_failed("internal server error", Some(&logger)).await);
        }

        if let Err(err) = self.update_status(JobStatus::Building).await {
            logger.log(&format!("ERROR: could not update status to 'building': {}", err));
            return Err(self.finish_failed("internal server error", Some(&logger)).await);
        }

        let workspace = match tempfile::Builder::new()
            .prefix(&format!("hubfly-builder-ws-{}-", self.job.id))
            .tempdir()
        {
            Ok(dir) => dir,
            Err(err) => {
                logger.log(&format!("ERROR: could not create workspace: {}", err));
                return Err(self.finish_failed("internal server error", Some(&logger)).await);
            }
        };
        logger.log(&format!("Created workspace: {}", workspace.path().display()));

        if !self
            .git_step(
                &logger,
                &[
                    "clone".to_string(),
                    self.job.source_info.git_repository.clone(),
                    workspace.path().to_string_lossy().into_owned(),
                ],
            )
            .await
        {
            logger.log("ERROR: failed to clone repository");
            return Err(self.finish_failed("failed to clone repository", Some(&logger)).await);
        }

        let git_ref = self.job.source_info.git_ref.clone();
        if !git_ref.is_empty() {
            logger.log(&format!("Checking out ref: {}", git_ref));
            if !self.checkout_step(&logger, workspace.path(), &git_ref).await {
                logger.log(&format!("ERROR: failed to checkout ref {}", git_ref));
                return Err(self.finish_failed("failed to checkout ref", Some(&logger)).await);
            }
        }

        let commit_sha = self.job.source_info.commit_sha.clone();
        if !commit_sha.is_empty() {
            logger.log(&format!("Checking out commit SHA: {}", commit_sha));
            if !self.checkout_step(&logger, workspace.path(), &commit_sha).await {
                logger.log(&format!("ERROR: failed to checkout commit {}", commit_sha));
                return Err(self.finish_failed("failed to checkout commit", Some(&logger)).await);
            }
        }

        logger.log("Repository cloned and checked out successfully.");

        let build_context = if self.job.source_info.working_dir.is_empty() {
            workspace.path().to_path_buf()
        } else {
            logger.log(&format!(
                "Using working directory: {}",
                self.job.source_info.working_dir
            ));
            workspace.path().join(&self.job.source_info.working_dir)
        };

        if self.job.build_config.env.is_empty() {
            if let Some(env) = self.job.env.as_ref().filter(|env| !env.is_empty()) {
                self.job.build_config.env = env.clone();
            }
        }

        let plan = envplan::resolve(
            &build_context,
            &self.job.build_config.env,
            &self.job.build_config.env_overrides,
        );
        self.job.build_config.resolved_env_plan = plan.entries.clone();
        log_resolved_env_plan(&logger, &plan.entries);
        if !self.job.build_config.env.is_empty() {
            if let Err(err) = self.persist_build_config().await {
                logger.log(&format!("WARNING: could not persist resolved env plan: {}", err));
            }
        }

        let (secrets, _secret_dir) =
            match prepare_build_secrets(&self.job.id, &plan.build_secrets) {
                Ok(prepared) => prepared,
                Err(err) => {
                    logger.log(&format!("ERROR: could not prepare build secrets: {}", err));
                    return Err(
                        self.finish_failed("failed to prepare build secrets", Some(&logger)).await
                    );
                }
            };

        let user_network = self.job.build_config.network.trim().to_string();
        if user_network.is_empty() {
            logger.log("ERROR: no user network provided");
            return Err(self.finish_failed("no user network provided", Some(&logger)).await);
        }

        logger.log(&format!(
            "Starting ephemeral BuildKit daemon for network: {}",
            user_network
        ));
        let session = match EphemeralBuildKit::start(
            self.deps.docker.clone(),
            EphemeralOpts {
                job_id: self.job.id.clone(),
                user_network,
                control_network: self.deps.settings.control_network.clone(),
            },
        )
        .await
        {
            Ok(session) => session,
            Err(err) => {
                logger.log(&format!(
                    "ERROR: failed to start ephemeral BuildKit daemon: {}",
                    err
                ));
                return Err(self
                    .finish_failed("failed to start ephemeral BuildKit daemon", Some(&logger))
                    .await);
            }
        };
        logger.log(&format!(
            "Ephemeral BuildKit ready: container={} controlNetwork={} userNetwork={} addr={}",
            session.container_name, session.control_network, session.user_network, session.addr
        ));

        let build_result = self
            .build_phase(&logger, &session, &build_context, &plan, secrets)
            .await;

        if let Err(stop_err) = session.stop().await {
            logger.log(&format!(
                "WARNING: failed to clean up ephemeral BuildKit daemon {}: {}",
                session.container_name, stop_err
            ));
        }

        match build_result {
            Ok(()) => self.finish_success(&logger).await,
            Err(reason) => Err(self.finish_failed(&reason, Some(&logger)).await),
        }
    }

    /// Everything from Dockerfile resolution through the pushed image.
    /// Returns the failure reason string on any error; the caller owns
    /// status updates and session teardown.
    async fn build_phase(
        &mut self,
        logger: &Arc<JobLogger>,
        session: &EphemeralBuildKit,
        build_context: &Path,
        plan: &EnvPlan,
        secrets: Vec<BuildSecret>,
    ) -> Result<(), String> {
        let dockerfile_path = build_context.join("Dockerfile");

        if dockerfile_path.exists() {
            logger.log("Dockerfile found in context, starting BuildKit build...");
            if !self.job.build_config.prebuild_command.is_empty() {
                logger.log(&format!(
                    "WARNING: PrebuildCommand '{}' is ignored because a Dockerfile was provided. \
                     Please include pre-build steps in your Dockerfile.",
                    self.job.build_config.prebuild_command
                ));
            }
        } else {
            logger.log("No Dockerfile found in context, attempting to auto-detect and generate...");
            if !self.job.build_config.is_auto_build {
                logger.log("ERROR: Auto-build is not enabled for this job.");
                return Err(
                    "No build strategy found (e.g., Dockerfile missing and auto-build disabled)"
                        .to_string(),
                );
            }

            let detection = detect::detect(build_context, &self.deps.allowlist);
            logger.log(&format!(
                "Auto-detected runtime: {}, version: {}",
                detection.runtime, detection.version
            ));
            if !detection.prebuild.is_empty() {
                logger.log(&format!("Auto-detected pre-build command: {}", detection.prebuild));
            }

            let dockerfile_content = match generate_dockerfile(
                detection.runtime,
                &detection.version,
                &detection.prebuild,
                &detection.build,
                &detection.run,
                &plan.build_arg_keys(),
                &plan.build_secret_keys(),
            ) {
                Ok(content) => content,
                Err(err) => {
                    logger.log(&format!("ERROR: failed to generate Dockerfile: {}", err));
                    return Err("failed to generate Dockerfile".to_string());
                }
            };

            self.job.build_config.runtime = detection.runtime.to_string();
            self.job.build_config.version = detection.version.clone();
            self.job.build_config.prebuild_command = detection.prebuild.clone();
            self.job.build_config.build_command = detection.build.clone();
            self.job.build_config.run_command = detection.run.clone();
            self.job.build_config.dockerfile_content = dockerfile_content.clone();
            if let Err(err) = self.persist_build_config().await {
                logger.log(&format!(
                    "WARNING: could not persist generated Dockerfile metadata: {}",
                    err
                ));
            }

            if let Err(err) = std::fs::write(&dockerfile_path, &dockerfile_content) {
                logger.log(&format!("ERROR: failed to write generated Dockerfile: {}", err));
                return Err("failed to write generated Dockerfile".to_string());
            }
            logger.log("Dockerfile generated successfully, starting BuildKit build...");
        }

        let image_tag = self.generate_image_tag();
        logger.log(&format!("Image tag: {}", image_tag));

        let buildkit = BuildKit::new(&session.addr);
        let args = buildkit.build_args(&BuildOpts {
            context_path: build_context.to_path_buf(),
            dockerfile_path: build_context.to_path_buf(),
            image_tag: image_tag.clone(),
            build_args: plan.build_args.clone(),
            secrets,
        });

        let timeout = match self.job.build_config.timeout_seconds {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        match run_logged(logger, "buildctl", &args, None, timeout).await {
            Ok(CommandOutcome::Completed(status)) if status.success() => {}
            Ok(CommandOutcome::Completed(status)) => {
                logger.log(&format!("ERROR: BuildKit build failed: {}", status));
                return Err("BuildKit build failed".to_string());
            }
            Ok(CommandOutcome::TimedOut) => {
                logger.log(&format!(
                    "ERROR: build exceeded timeout of {}s",
                    self.job.build_config.timeout_seconds
                ));
                return Err("build timed out".to_string());
            }
            Err(err) => {
                logger.log(&format!("ERROR: BuildKit build failed: {}", err));
                return Err("BuildKit build failed".to_string());
            }
        }
        logger.log("BuildKit build and push successful.");

        self.job.image_tag = image_tag.clone();
        let job_id = self.job.id.clone();
        if let Err(err) = self
            .deps
            .db
            .call(move |db| db.update_image_tag(&job_id, &image_tag))
            .await
        {
            // Persistence of the tag is best-effort; the build already
            // pushed.
            logger.log(&format!("ERROR: could not update image tag: {}", err));
        }

        Ok(())
    }

    async fn finish_success(&mut self, logger: &Arc<JobLogger>) -> Result<(), WorkerError> {
        info!(job_id = %self.job.id, "succeeding job");
        self.job.finished_at = Some(Utc::now());
        if let Err(err) = self.update_status(JobStatus::Success).await {
            error!(job_id = %self.job.id, error = %err, "could not update status to 'success'");
            return Err(WorkerError::Internal(err));
        }
        if let Err(err) = self.deps.callback.report_result(&self.job, "success", "").await {
            logger.log(&format!("ERROR: could not report result to backend: {}", err));
        }
        Ok(())
    }

    async fn finish_failed(&mut self, reason: &str, logger: Option<&Arc<JobLogger>>) -> WorkerError {
        error!(job_id = %self.job.id, reason = %reason, "failing job");
        self.job.finished_at = Some(Utc::now());
        if let Err(err) = self.update_status(JobStatus::Failed).await {
            error!(job_id = %self.job.id, error = %err, "could not update job status to 'failed'");
        }
        if let Err(err) = self.deps.callback.report_result(&self.job, "failed", reason).await {
            match logger {
                Some(logger) => {
                    logger.log(&format!("ERROR: could not report result to backend: {}", err))
                }
                None => error!(job_id = %self.job.id, error = %err, "could not report result"),
            }
        }
        WorkerError::BuildFailed {
            reason: reason.to_string(),
        }
    }

    async fn update_status(&self, status: JobStatus) -> Result<()> {
        let job_id = self.job.id.clone();
        self.deps
            .db
            .call(move |db| db.update_status(&job_id, status))
            .await
    }

    async fn persist_build_config(&self) -> Result<()> {
        let job_id = self.job.id.clone();
        let config = self.job.build_config.clone();
        self.deps
            .db
            .call(move |db| db.update_build_config(&job_id, &config))
            .await
    }

    async fn git_step(&self, logger: &Arc<JobLogger>, args: &[String]) -> bool {
        matches!(
            run_logged(logger, "git", args, None, None).await,
            Ok(CommandOutcome::Completed(status)) if status.success()
        )
    }

    async fn checkout_step(&self, logger: &Arc<JobLogger>, workspace: &Path, rev: &str) -> bool {
        let args = vec![
            "-C".to_string(),
            workspace.to_string_lossy().into_owned(),
            "checkout".to_string(),
            rev.to_string(),
        ];
        self.git_step(logger, &args).await
    }

    /// `<registry>/<user>/<project>:<shortSha>-b<jobId>-v<timestamp>` with
    /// identifiers lowercased and underscores mapped to dashes.
    fn generate_image_tag(&self) -> String {
        let ts = Utc::now().format(COMPACT_UTC_FORMAT);
        let mut short_sha = self.job.source_info.commit_sha.clone();
        if short_sha.len() > 12 {
            let mut cut = 12;
            while !short_sha.is_char_boundary(cut) {
                cut -= 1;
            }
            short_sha.truncate(cut);
        }
        format!(
            "{}/{}/{}:{}-b{}-v{}",
            self.deps.settings.registry_url,
            sanitize_identifier(&self.job.user_id),
            sanitize_identifier(&self.job.project_id),
            short_sha,
            self.job.id,
            ts
        )
    }
}

fn sanitize_identifier(value: &str) -> String {
    value.to_lowercase().replace('_', "-")
}

fn log_resolved_env_plan(logger: &Arc<JobLogger>, entries: &[ResolvedEnvVar]) {
    if entries.is_empty() {
        logger.log("Env auto-resolution: no env variables provided");
        return;
    }
    for entry in entries {
        logger.log(&format!(
            "Env auto-resolution: key={} scope={} secret={} reason={}",
            entry.key, entry.scope, entry.secret, entry.reason
        ));
    }
}

/// Materialize secret values into `<idx>_<sanitizedKey>` files (mode
/// 0600) inside a private per-job tempdir. The returned `TempDir` removes
/// everything on drop.
fn prepare_build_secrets(
    job_id: &str,
    secret_values: &std::collections::BTreeMap<String, String>,
) -> Result<(Vec<BuildSecret>, Option<tempfile::TempDir>)> {
    if secret_values.is_empty() {
        return Ok((Vec::new(), None));
    }

    let secret_dir = tempfile::Builder::new()
        .prefix(&format!("hubfly-builder-secrets-{}-", job_id))
        .tempdir()
        .context("failed to create secret directory")?;

    let mut secrets = Vec::with_capacity(secret_values.len());
    for (idx, (key, value)) in secret_values.iter().enumerate() {
        let file_name = format!("{:03}_{}", idx, sanitize_secret_filename(key));
        let path = secret_dir.path().join(file_name);
        write_secret_file(&path, value)
            .with_context(|| format!("failed to write secret file for {}", key))?;
        secrets.push(BuildSecret {
            id: key.clone(),
            src: path,
        });
    }

    Ok((secrets, Some(secret_dir)))
}

#[cfg(unix)]
fn write_secret_file(path: &PathBuf, value: &str) -> std::io::Result<()> {
    use std::os::unix::fs::OpenOptionsExt;
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(value.as_bytes())
}

#[cfg(not(unix))]
fn write_secret_file(path: &PathBuf, value: &str) -> std::io::Result<()> {
    std::fs::write(path, value)
}

fn sanitize_secret_filename(value: &str) -> String {
    let mapped: String = value
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect();
    if mapped.is_empty() {
        "secret".to_string()
    } else {
        mapped
    }
}

/// Spawn a command with piped stdio, stream both pipes into the job log
/// concurrently, and wait for the streams to drain and the process to
/// exit. An expired timeout kills the process and reports `TimedOut`.
async fn run_logged(
    logger: &Arc<JobLogger>,
    program: &str,
    args: &[String],
    cwd: Option<&Path>,
    timeout: Option<Duration>,
) -> Result<CommandOutcome> {
    logger.log(&format!("Executing: {}", sanitize_command_for_log(program, args)));

    let mut cmd = Command::new(program);
    cmd.args(args).stdout(Stdio::piped()).stderr(Stdio::piped());
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn {}", program))?;
    let stdout = child.stdout.take().context("missing stdout pipe")?;
    let stderr = child.stderr.take().context("missing stderr pipe")?;

    let out_task = tokio::spawn(stream_pipe(logger.clone(), stdout));
    let err_task = tokio::spawn(stream_pipe(logger.clone(), stderr));

    let outcome = match timeout {
        Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
            Ok(status) => CommandOutcome::Completed(status?),
            Err(_) => {
                let _ = child.kill().await;
                let _ = child.wait().await;
                CommandOutcome::TimedOut
            }
        },
        None => CommandOutcome::Completed(child.wait().await?),
    };

    // Killing the child closes its pipes, so both drains terminate.
    let _ = out_task.await;
    let _ = err_task.await;

    Ok(outcome)
}

async fn stream_pipe<R>(logger: Arc<JobLogger>, pipe: R)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(pipe).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        logger.log(&line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::{BuildConfig, SourceInfo};
    use crate::store::JobStore;
    use regex::Regex;
    use std::collections::BTreeMap;

    fn test_deps(log_dir: &Path) -> WorkerDeps {
        WorkerDeps {
            db: DbHandle::new(JobStore::new_in_memory().unwrap()),
            logs: Arc::new(LogManager::new(log_dir).unwrap()),
            allowlist: Arc::new(AllowedCommands::default()),
            callback: Arc::new(CallbackClient::new("")),
            docker: Docker::connect_with_socket_defaults().unwrap(),
            settings: Arc::new(Settings::default()),
        }
    }

    fn test_job(id: &str) -> BuildJob {
        BuildJob {
            id: id.to_string(),
            project_id: "My_Project".into(),
            user_id: "Some_User".into(),
            source_type: "git".into(),
            source_info: SourceInfo {
                git_repository: "/nonexistent/definitely-not-a-repo.git".into(),
                commit_sha: "0123456789abcdef0123456789abcdef01234567".into(),
                git_ref: String::new(),
                working_dir: String::new(),
            },
            env: None,
            build_config: BuildConfig {
                network: "proj-net".into(),
                ..Default::default()
            },
            status: JobStatus::Claimed,
            image_tag: String::new(),
            started_at: None,
            finished_at: None,
            exit_code: None,
            retry_count: 0,
            log_path: String::new(),
            last_checkpoint: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_image_tag_format() {
        let dir = tempfile::tempdir().unwrap();
        let worker = Worker::new(test_job("job1"), test_deps(dir.path()));
        let tag = worker.generate_image_tag();

        let pattern =
            Regex::new(r"^[^/]+/[a-z0-9-]+/[a-z0-9-]+:[0-9a-f]{0,12}-b[^-]+-v[0-9]{8}T[0-9]{6}Z$")
                .unwrap();
        assert!(pattern.is_match(&tag), "tag {} does not match", tag);
        assert!(tag.starts_with("localhost:5000/some-user/my-project:012345678"));
        assert!(tag.contains("-bjob1-v"));
    }

    #[test]
    fn test_image_tag_short_sha_passthrough() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = test_job("job1");
        job.source_info.commit_sha = "abc".into();
        let worker = Worker::new(job, test_deps(dir.path()));
        assert!(worker.generate_image_tag().contains(":abc-bjob1-v"));
    }

    #[test]
    fn test_sanitize_identifier() {
        assert_eq!(sanitize_identifier("Some_User"), "some-user");
        assert_eq!(sanitize_identifier("plain"), "plain");
    }

    #[test]
    fn test_prepare_build_secrets_files() {
        let secrets = BTreeMap::from([
            ("API_TOKEN".to_string(), "tok-value".to_string()),
            ("DB/PASS".to_string(), "pw".to_string()),
        ]);
        let (prepared, dir) = prepare_build_secrets("job1", &secrets).unwrap();
        let dir = dir.expect("secret dir");

        assert_eq!(prepared.len(), 2);
        assert_eq!(prepared[0].id, "API_TOKEN");
        assert!(prepared[0]
            .src
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("000_API_TOKEN"));
        assert!(prepared[1]
            .src
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("001_DB_PASS"));

        assert_eq!(std::fs::read_to_string(&prepared[0].src).unwrap(), "tok-value");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&prepared[0].src).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        let path = dir.path().to_path_buf();
        drop(dir);
        assert!(!path.exists(), "secret dir must be removed on drop");
    }

    #[test]
    fn test_prepare_build_secrets_empty() {
        let (prepared, dir) = prepare_build_secrets("job1", &BTreeMap::new()).unwrap();
        assert!(prepared.is_empty());
        assert!(dir.is_none());
    }

    #[test]
    fn test_sanitize_secret_filename() {
        assert_eq!(sanitize_secret_filename("API_TOKEN"), "API_TOKEN");
        assert_eq!(sanitize_secret_filename("a b/c"), "a_b_c");
        assert_eq!(sanitize_secret_filename(""), "secret");
    }

    #[tokio::test]
    async fn test_worker_fails_on_clone_error() {
        let dir = tempfile::tempdir().unwrap();
        let deps = test_deps(dir.path());

        let mut job = test_job("job1");
        {
            let db = deps.db.clone();
            let mut to_store = job.clone();
            db.call(move |store| {
                store.create_job(&mut to_store)?;
                store.update_status("job1", JobStatus::Claimed)?;
                Ok(())
            })
            .await
            .unwrap();
        }
        job.status = JobStatus::Claimed;

        let result = Worker::new(job, deps.clone()).run().await;
        match result {
            Err(WorkerError::BuildFailed { reason }) => {
                assert_eq!(reason, "failed to clone repository");
            }
            other => panic!("expected BuildFailed, got {:?}", other.err()),
        }

        let stored = deps.db.call(|db| db.get_job("job1")).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(!stored.log_path.is_empty(), "log path must be recorded");
        assert!(stored.finished_at.is_some());

        let log = std::fs::read_to_string(&stored.log_path).unwrap();
        assert!(log.contains("Created workspace:"));
        assert!(log.contains("Executing: git clone"));
    }

    #[tokio::test]
    async fn test_worker_fails_without_network() {
        let dir = tempfile::tempdir().unwrap();
        let deps = test_deps(dir.path());

        // A local empty git repo keeps the clone step offline.
        let repo = tempfile::tempdir().unwrap();
        let status = std::process::Command::new("git")
            .args(["init", "--quiet", &repo.path().to_string_lossy()])
            .status()
            .expect("git init");
        assert!(status.success());

        let mut job = test_job("job2");
        job.source_info.git_repository = repo.path().to_string_lossy().into_owned();
        job.source_info.commit_sha = String::new();
        job.build_config.network = "   ".into();
        {
            let db = deps.db.clone();
            let mut to_store = job.clone();
            db.call(move |store| {
                store.create_job(&mut to_store)?;
                Ok(())
            })
            .await
            .unwrap();
        }

        let result = Worker::new(job, deps.clone()).run().await;
        match result {
            Err(WorkerError::BuildFailed { reason }) => {
                assert_eq!(reason, "no user network provided");
            }
            other => panic!("expected BuildFailed, got {:?}", other.err()),
        }

        let stored = deps.db.call(|db| db.get_job("job2")).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_run_logged_streams_both_pipes() {
        let dir = tempfile::tempdir().unwrap();
        let manager = LogManager::new(dir.path()).unwrap();
        let (path, file) = manager.create_log_file("job1").unwrap();
        let logger = JobLogger::new(file);

        let outcome = run_logged(
            &logger,
            "sh",
            &["-c".to_string(), "echo out-line; echo err-line 1>&2".to_string()],
            None,
            None,
        )
        .await
        .unwrap();
        assert!(matches!(outcome, CommandOutcome::Completed(status) if status.success()));

        let log = std::fs::read_to_string(&path).unwrap();
        assert!(log.contains("out-line"));
        assert!(log.contains("err-line"));
    }

    #[tokio::test]
    async fn test_run_logged_timeout_kills_process() {
        let dir = tempfile::tempdir().unwrap();
        let manager = LogManager::new(dir.path()).unwrap();
        let (_path, file) = manager.create_log_file("job1").unwrap();
        let logger = JobLogger::new(file);

        let started = std::time::Instant::now();
        let outcome = run_logged(
            &logger,
            "sleep",
            &["30".to_string()],
            None,
            Some(Duration::from_millis(200)),
        )
        .await
        .unwrap();
        assert!(matches!(outcome, CommandOutcome::TimedOut));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
