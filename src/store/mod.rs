//! SQLite-backed persistence for build jobs.
//!
//! `JobStore` owns the connection and exposes synchronous operations;
//! `DbHandle` wraps it behind `Arc<Mutex>` and runs all access on tokio's
//! blocking thread pool via `spawn_blocking`, preventing synchronous
//! SQLite I/O from tying up async worker threads.

pub mod models;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};

pub use models::{
    BuildConfig, BuildJob, EnvOverride, EnvScope, JobStatus, ResolvedEnvVar, ResourceLimits,
    SourceInfo,
};

/// Async-safe handle to the job store.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<JobStore>>,
}

impl DbHandle {
    pub fn new(store: JobStore) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(store)),
        }
    }

    /// Run a closure with access to the store on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&JobStore) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = store
                .lock()
                .map_err(|e| anyhow::anyhow!("store lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("store task panicked")?
    }
}

pub struct JobStore {
    conn: Connection,
}

const JOB_COLUMNS: &str = "id, project_id, user_id, source_type, source_info, build_config, \
     status, image_tag, started_at, finished_at, exit_code, retry_count, \
     log_path, last_checkpoint, created_at, updated_at";

impl JobStore {
    /// Open (or create) the SQLite database at the given path and run
    /// migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("failed to open SQLite database")?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    /// Create an in-memory store (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("failed to open in-memory SQLite database")?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS build_jobs (
                    id TEXT PRIMARY KEY,
                    project_id TEXT NOT NULL DEFAULT '',
                    user_id TEXT NOT NULL DEFAULT '',
                    source_type TEXT NOT NULL DEFAULT '',
                    source_info TEXT NOT NULL DEFAULT '{}',
                    build_config TEXT NOT NULL DEFAULT '{}',
                    status TEXT NOT NULL DEFAULT 'pending',
                    image_tag TEXT NOT NULL DEFAULT '',
                    started_at TEXT NULL,
                    finished_at TEXT NULL,
                    exit_code INTEGER NULL,
                    retry_count INTEGER NOT NULL DEFAULT 0,
                    log_path TEXT NOT NULL DEFAULT '',
                    last_checkpoint TEXT NOT NULL DEFAULT '',
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );
                ",
            )
            .context("failed to run migrations")?;
        Ok(())
    }

    /// Insert a new job. Status is forced to `pending` regardless of input
    /// and the created/updated stamps are set to the current wall clock;
    /// the passed job is updated in place so the caller can echo it back.
    pub fn create_job(&self, job: &mut BuildJob) -> Result<()> {
        let now = Utc::now();
        job.created_at = now;
        job.updated_at = now;
        job.status = JobStatus::Pending;

        let source_info = serde_json::to_string(&job.source_info)?;
        let build_config = serde_json::to_string(&job.build_config)?;

        self.conn
            .execute(
                "INSERT INTO build_jobs (id, project_id, user_id, source_type, source_info, \
                 build_config, status, image_tag, started_at, finished_at, exit_code, \
                 retry_count, log_path, last_checkpoint, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                params![
                    job.id,
                    job.project_id,
                    job.user_id,
                    job.source_type,
                    source_info,
                    build_config,
                    job.status.as_str(),
                    job.image_tag,
                    job.started_at.map(|t| t.to_rfc3339()),
                    job.finished_at.map(|t| t.to_rfc3339()),
                    job.exit_code,
                    job.retry_count,
                    job.log_path,
                    job.last_checkpoint,
                    job.created_at.to_rfc3339(),
                    job.updated_at.to_rfc3339(),
                ],
            )
            .with_context(|| format!("failed to insert job {}", job.id))?;
        Ok(())
    }

    pub fn get_job(&self, id: &str) -> Result<Option<BuildJob>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM build_jobs WHERE id = ?1",
            JOB_COLUMNS
        ))?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => Ok(Some(job_from_row(row)?)),
            None => Ok(None),
        }
    }

    /// Oldest pending job by `created_at`. Does NOT claim: the dispatcher
    /// claims by a subsequent `update_status(claimed)`. With exactly one
    /// dispatcher per process the non-atomic claim is safe; a multi-writer
    /// store would need an atomic
    /// `UPDATE ... WHERE status='pending' RETURNING` here instead.
    pub fn get_pending_job(&self) -> Result<Option<BuildJob>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM build_jobs WHERE status = 'pending' ORDER BY created_at ASC LIMIT 1",
            JOB_COLUMNS
        ))?;
        let mut rows = stmt.query([])?;
        match rows.next()? {
            Some(row) => Ok(Some(job_from_row(row)?)),
            None => Ok(None),
        }
    }

    /// Transition a job's status. Terminal statuses also stamp
    /// `finished_at`.
    pub fn update_status(&self, id: &str, status: JobStatus) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        if status.is_terminal() {
            self.conn.execute(
                "UPDATE build_jobs SET status = ?1, finished_at = ?2, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), now, id],
            )?;
        } else {
            self.conn.execute(
                "UPDATE build_jobs SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), now, id],
            )?;
        }
        Ok(())
    }

    pub fn update_log_path(&self, id: &str, log_path: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE build_jobs SET log_path = ?1, updated_at = ?2 WHERE id = ?3",
            params![log_path, Utc::now().to_rfc3339(), id],
        )?;
        Ok(())
    }

    pub fn update_image_tag(&self, id: &str, image_tag: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE build_jobs SET image_tag = ?1, updated_at = ?2 WHERE id = ?3",
            params![image_tag, Utc::now().to_rfc3339(), id],
        )?;
        Ok(())
    }

    pub fn update_build_config(&self, id: &str, build_config: &BuildConfig) -> Result<()> {
        let encoded = serde_json::to_string(build_config)?;
        self.conn.execute(
            "UPDATE build_jobs SET build_config = ?1, updated_at = ?2 WHERE id = ?3",
            params![encoded, Utc::now().to_rfc3339(), id],
        )?;
        Ok(())
    }

    pub fn increment_retry_count(&self, id: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE build_jobs SET retry_count = retry_count + 1, updated_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), id],
        )?;
        Ok(())
    }

    /// Startup recovery: any job left mid-flight by a previous process
    /// goes back to the queue.
    pub fn reset_in_progress_jobs(&self) -> Result<usize> {
        let n = self.conn.execute(
            "UPDATE build_jobs SET status = 'pending', updated_at = ?1 \
             WHERE status = 'claimed' OR status = 'building'",
            params![Utc::now().to_rfc3339()],
        )?;
        Ok(n)
    }

    /// Dev-only: truncate the store.
    pub fn reset_all(&self) -> Result<()> {
        self.conn.execute("DELETE FROM build_jobs", [])?;
        Ok(())
    }
}

fn job_from_row(row: &Row<'_>) -> Result<BuildJob> {
    let source_info: String = row.get(4)?;
    let build_config: String = row.get(5)?;
    let status: String = row.get(6)?;

    let build_config: BuildConfig =
        serde_json::from_str(&build_config).context("corrupt build_config column")?;
    let env = if build_config.env.is_empty() {
        None
    } else {
        Some(build_config.env.clone())
    };

    Ok(BuildJob {
        id: row.get(0)?,
        project_id: row.get(1)?,
        user_id: row.get(2)?,
        source_type: row.get(3)?,
        source_info: serde_json::from_str(&source_info).context("corrupt source_info column")?,
        env,
        build_config,
        status: status
            .parse()
            .map_err(|e: String| anyhow::anyhow!("corrupt status column: {}", e))?,
        image_tag: row.get(7)?,
        started_at: parse_timestamp(row.get::<_, Option<String>>(8)?)?,
        finished_at: parse_timestamp(row.get::<_, Option<String>>(9)?)?,
        exit_code: row.get(10)?,
        retry_count: row.get(11)?,
        log_path: row.get(12)?,
        last_checkpoint: row.get(13)?,
        created_at: parse_timestamp(Some(row.get::<_, String>(14)?))?
            .context("missing created_at")?,
        updated_at: parse_timestamp(Some(row.get::<_, String>(15)?))?
            .context("missing updated_at")?,
    })
}

fn parse_timestamp(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    match value {
        None => Ok(None),
        Some(raw) => {
            let parsed = DateTime::parse_from_rfc3339(&raw)
                .with_context(|| format!("invalid timestamp '{}'", raw))?;
            Ok(Some(parsed.with_timezone(&Utc)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn sample_job(id: &str) -> BuildJob {
        BuildJob {
            id: id.to_string(),
            project_id: "proj_1".into(),
            user_id: "user_1".into(),
            source_type: "git".into(),
            source_info: SourceInfo {
                git_repository: "https://example.com/app.git".into(),
                git_ref: "main".into(),
                commit_sha: String::new(),
                working_dir: String::new(),
            },
            env: None,
            build_config: BuildConfig {
                network: "proj-net".into(),
                ..Default::default()
            },
            status: JobStatus::Pending,
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
    fn test_create_and_get_roundtrip() {
        let store = JobStore::new_in_memory().unwrap();
        let mut job = sample_job("job1");
        store.create_job(&mut job).unwrap();

        let loaded = store.get_job("job1").unwrap().unwrap();
        assert_eq!(loaded.id, "job1");
        assert_eq!(loaded.source_info.git_repository, "https://example.com/app.git");
        assert_eq!(loaded.build_config.network, "proj-net");
        assert_eq!(loaded.status, JobStatus::Pending);
    }

    #[test]
    fn test_get_missing_job_is_none() {
        let store = JobStore::new_in_memory().unwrap();
        assert!(store.get_job("nope").unwrap().is_none());
    }

    #[test]
    fn test_create_forces_pending_status() {
        let store = JobStore::new_in_memory().unwrap();
        let mut job = sample_job("job1");
        job.status = JobStatus::Success;
        store.create_job(&mut job).unwrap();

        assert_eq!(job.status, JobStatus::Pending);
        let loaded = store.get_job("job1").unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Pending);
    }

    #[test]
    fn test_pending_pick_is_fifo_by_created_at() {
        let store = JobStore::new_in_memory().unwrap();
        let mut first = sample_job("older");
        store.create_job(&mut first).unwrap();
        // Force a strictly later created_at for the second job.
        std::thread::sleep(std::time::Duration::from_millis(5));
        let mut second = sample_job("newer");
        store.create_job(&mut second).unwrap();

        let picked = store.get_pending_job().unwrap().unwrap();
        assert_eq!(picked.id, "older");

        // Claiming the oldest surfaces the next one.
        store.update_status("older", JobStatus::Claimed).unwrap();
        let picked = store.get_pending_job().unwrap().unwrap();
        assert_eq!(picked.id, "newer");
    }

    #[test]
    fn test_pending_pick_ignores_non_pending() {
        let store = JobStore::new_in_memory().unwrap();
        let mut job = sample_job("job1");
        store.create_job(&mut job).unwrap();
        store.update_status("job1", JobStatus::Building).unwrap();

        assert!(store.get_pending_job().unwrap().is_none());
    }

    #[test]
    fn test_terminal_status_sets_finished_at() {
        let store = JobStore::new_in_memory().unwrap();
        let mut job = sample_job("job1");
        store.create_job(&mut job).unwrap();

        store.update_status("job1", JobStatus::Building).unwrap();
        let loaded = store.get_job("job1").unwrap().unwrap();
        assert!(loaded.finished_at.is_none());

        store.update_status("job1", JobStatus::Failed).unwrap();
        let loaded = store.get_job("job1").unwrap().unwrap();
        assert!(loaded.finished_at.is_some());
    }

    #[test]
    fn test_reset_in_progress_jobs() {
        let store = JobStore::new_in_memory().unwrap();
        for (id, status) in [
            ("a", JobStatus::Claimed),
            ("b", JobStatus::Building),
            ("c", JobStatus::Success),
            ("d", JobStatus::Failed),
        ] {
            let mut job = sample_job(id);
            store.create_job(&mut job).unwrap();
            store.update_status(id, status).unwrap();
        }

        let reset = store.reset_in_progress_jobs().unwrap();
        assert_eq!(reset, 2);
        assert_eq!(store.get_job("a").unwrap().unwrap().status, JobStatus::Pending);
        assert_eq!(store.get_job("b").unwrap().unwrap().status, JobStatus::Pending);
        assert_eq!(store.get_job("c").unwrap().unwrap().status, JobStatus::Success);
        assert_eq!(store.get_job("d").unwrap().unwrap().status, JobStatus::Failed);
    }

    #[test]
    fn test_increment_retry_count() {
        let store = JobStore::new_in_memory().unwrap();
        let mut job = sample_job("job1");
        store.create_job(&mut job).unwrap();

        store.increment_retry_count("job1").unwrap();
        store.increment_retry_count("job1").unwrap();
        let loaded = store.get_job("job1").unwrap().unwrap();
        assert_eq!(loaded.retry_count, 2);
    }

    #[test]
    fn test_update_build_config_persists_plan() {
        let store = JobStore::new_in_memory().unwrap();
        let mut job = sample_job("job1");
        store.create_job(&mut job).unwrap();

        job.build_config.resolved_env_plan = vec![ResolvedEnvVar {
            key: "API_TOKEN".into(),
            scope: EnvScope::Build,
            secret: true,
            reason: "dockerfile-arg+override-secret".into(),
        }];
        store.update_build_config("job1", &job.build_config).unwrap();

        let loaded = store.get_job("job1").unwrap().unwrap();
        assert_eq!(loaded.build_config.resolved_env_plan.len(), 1);
        assert_eq!(loaded.build_config.resolved_env_plan[0].key, "API_TOKEN");
    }

    #[test]
    fn test_top_level_env_mirrors_config_env() {
        let store = JobStore::new_in_memory().unwrap();
        let mut job = sample_job("job1");
        job.build_config.env = HashMap::from([("PORT".to_string(), "3000".to_string())]);
        store.create_job(&mut job).unwrap();

        let loaded = store.get_job("job1").unwrap().unwrap();
        let env = loaded.env.expect("env mirror");
        assert_eq!(env.get("PORT").map(String::as_str), Some("3000"));
    }

    #[test]
    fn test_reset_all_truncates() {
        let store = JobStore::new_in_memory().unwrap();
        let mut job = sample_job("job1");
        store.create_job(&mut job).unwrap();
        store.reset_all().unwrap();
        assert!(store.get_job("job1").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_db_handle_runs_on_blocking_pool() {
        let handle = DbHandle::new(JobStore::new_in_memory().unwrap());
        let mut job = sample_job("job1");
        let stored = handle
            .call(move |db| {
                db.create_job(&mut job)?;
                Ok(job)
            })
            .await
            .unwrap();
        assert_eq!(stored.status, JobStatus::Pending);

        let loaded = handle
            .call(|db| db.get_job("job1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.id, "job1");
    }
}
