//! HTTP API: job submission and retrieval, log download, dev endpoints.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::allowlist::AllowedCommands;
use crate::detect;
use crate::executor::Dispatcher;
use crate::logs::LogManager;
use crate::store::models::BuildJob;
use crate::store::DbHandle;
use crate::vcs;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub logs: Arc<LogManager>,
    pub dispatcher: Dispatcher,
    pub allowlist: Arc<AllowedCommands>,
}

pub type SharedState = Arc<AppState>;

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound {
        code: &'static str,
        message: String,
    },
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::NotFound { code, message } => (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({"error": code, "message": message})),
            )
                .into_response(),
            ApiError::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": message})),
            )
                .into_response(),
            ApiError::Internal(message) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": message})),
            )
                .into_response(),
        }
    }
}

fn job_not_found() -> ApiError {
    ApiError::NotFound {
        code: "JOB_NOT_FOUND",
        message: "job not found".to_string(),
    }
}

fn build_log_not_found() -> ApiError {
    ApiError::NotFound {
        code: "BUILD_LOG_NOT_FOUND",
        message: "build log not found".to_string(),
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/v1/jobs", post(create_job))
        .route("/api/v1/jobs/:id", get(get_job))
        .route("/api/v1/jobs/:id/logs", get(get_job_logs))
        .route("/dev/running-builds", get(running_builds))
        .route("/dev/reset-db", post(reset_db))
        .route("/healthz", get(healthz))
}

/// Bind and serve the API.
pub async fn serve(state: SharedState, port: u16) -> anyhow::Result<()> {
    let app = api_router()
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn create_job(
    State(state): State<SharedState>,
    Json(mut job): Json<BuildJob>,
) -> Result<(StatusCode, Json<BuildJob>), ApiError> {
    if job.id.trim().is_empty() {
        return Err(ApiError::BadRequest("job id is required".to_string()));
    }
    if job.source_info.git_repository.trim().is_empty() {
        return Err(ApiError::BadRequest(
            "sourceInfo.gitRepository is required".to_string(),
        ));
    }
    if job.build_config.network.trim().is_empty() {
        return Err(ApiError::BadRequest(
            "buildConfig.network is required".to_string(),
        ));
    }

    if job.build_config.is_auto_build {
        pre_synthesize(&state, &mut job).await?;
    }

    let mut to_store = job;
    let stored = state
        .db
        .call(move |db| {
            db.create_job(&mut to_store)?;
            Ok(to_store)
        })
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;

    // Wake the dispatcher out of band with its periodic tick.
    state.dispatcher.signal_new_job();

    Ok((StatusCode::CREATED, Json(stored)))
}

/// Clone the source into a scratch directory and run the detector so the
/// creation response already carries the synthesized recipe. Computed
/// fields replace the caller-supplied runtime/version/commands/recipe;
/// everything else (network, env, limits, timeout) is preserved.
async fn pre_synthesize(state: &SharedState, job: &mut BuildJob) -> Result<(), ApiError> {
    let scratch = tempfile::Builder::new()
        .prefix("hubfly-builder-autodetect-")
        .tempdir()
        .map_err(|err| ApiError::Internal(format!("failed to create temp dir: {}", err)))?;

    vcs::clone_repo(&job.source_info.git_repository, scratch.path())
        .await
        .map_err(|err| {
            ApiError::BadRequest(format!("failed to clone repository for autodetect: {}", err))
        })?;

    if !job.source_info.git_ref.is_empty() {
        vcs::checkout(scratch.path(), &job.source_info.git_ref)
            .await
            .map_err(|_| {
                ApiError::BadRequest(format!(
                    "failed to checkout ref {}",
                    job.source_info.git_ref
                ))
            })?;
    }
    if !job.source_info.commit_sha.is_empty() {
        vcs::checkout(scratch.path(), &job.source_info.commit_sha)
            .await
            .map_err(|_| {
                ApiError::BadRequest(format!(
                    "failed to checkout commit {}",
                    job.source_info.commit_sha
                ))
            })?;
    }

    let inspect_dir = if job.source_info.working_dir.is_empty() {
        scratch.path().to_path_buf()
    } else {
        scratch.path().join(&job.source_info.working_dir)
    };

    let detected = detect::auto_detect_build_config(&inspect_dir, &state.allowlist)
        .map_err(|err| {
            ApiError::BadRequest(format!("failed to autodetect build config: {}", err))
        })?;

    job.build_config.runtime = detected.runtime.to_string();
    job.build_config.version = detected.version;
    job.build_config.prebuild_command = detected.prebuild_command;
    job.build_config.build_command = detected.build_command;
    job.build_config.run_command = detected.run_command;
    job.build_config.dockerfile_content = detected.dockerfile_content;

    Ok(())
}

async fn get_job(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<BuildJob>, ApiError> {
    let lookup = id.clone();
    let job = state
        .db
        .call(move |db| db.get_job(&lookup))
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    job.map(Json).ok_or_else(job_not_found)
}

async fn get_job_logs(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let lookup = id.clone();
    let job = state
        .db
        .call(move |db| db.get_job(&lookup))
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?
        .ok_or_else(job_not_found)?;

    if job.log_path.is_empty() {
        return Err(build_log_not_found());
    }

    let bytes = match state.logs.read_log(&job.log_path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(build_log_not_found());
        }
        Err(err) => return Err(ApiError::Internal(err.to_string())),
    };

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        bytes,
    )
        .into_response())
}

async fn running_builds(
    State(state): State<SharedState>,
) -> Result<Json<Vec<BuildJob>>, ApiError> {
    let mut jobs = Vec::new();
    for id in state.dispatcher.active_builds() {
        let lookup = id.clone();
        match state.db.call(move |db| db.get_job(&lookup)).await {
            Ok(Some(job)) => jobs.push(job),
            Ok(None) => {}
            Err(err) => {
                warn!(job_id = %id, error = %err, "could not get job details for active job");
            }
        }
    }
    Ok(Json(jobs))
}

async fn reset_db(State(state): State<SharedState>) -> Result<Response, ApiError> {
    state
        .db
        .call(|db| db.reset_all())
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    Ok((StatusCode::OK, "Database reset successful\n").into_response())
}

async fn healthz() -> &'static str {
    "OK"
}
