use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bollard::Docker;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use hubfly_builder::allowlist::AllowedCommands;
use hubfly_builder::buildkit::session;
use hubfly_builder::callback::CallbackClient;
use hubfly_builder::config::{self, Settings};
use hubfly_builder::executor::{Dispatcher, WorkerDeps};
use hubfly_builder::logs::LogManager;
use hubfly_builder::server::{self, AppState};
use hubfly_builder::store::{DbHandle, JobStore};

const LOG_RETENTION: Duration = Duration::from_secs(7 * 24 * 3600);
const LOG_CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Parser)]
#[command(name = "hubfly-builder")]
#[command(version, about = "Single-node build orchestrator: Git ref in, pushed container image out")]
struct Cli {
    /// Listen port (overrides the PORT environment variable)
    #[arg(long)]
    port: Option<u16>,

    /// Path to the SQLite job store
    #[arg(long, default_value = "./hubfly-builder.sqlite")]
    db: PathBuf,

    /// Directory for build and system log files
    #[arg(long, default_value = "./log")]
    log_dir: PathBuf,

    /// Path to the command allowlist file
    #[arg(long, default_value = "configs/allowed-commands.json")]
    allowlist: PathBuf,

    /// Maximum number of concurrent builds
    #[arg(long, default_value_t = config::DEFAULT_MAX_CONCURRENT)]
    max_concurrent: usize,

    /// Maximum retries for a failed build
    #[arg(long, default_value_t = config::DEFAULT_MAX_RETRIES)]
    max_retries: i64,

    /// Verbose logs
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Err(err) = config::load_or_init_env_config() {
        eprintln!("WARN: could not load env config: {:#}", err);
    }

    let mut settings = Settings {
        db_path: cli.db.clone(),
        log_dir: cli.log_dir.clone(),
        allowlist_path: cli.allowlist.clone(),
        max_concurrent: cli.max_concurrent,
        max_retries: cli.max_retries,
        ..Default::default()
    }
    .apply_env();
    if let Some(port) = cli.port {
        settings.port = port;
    }

    let log_manager = Arc::new(LogManager::new(&settings.log_dir)?);
    let (system_log_path, system_log_file) = log_manager.create_system_log_file()?;

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("HUBFLY_LOG").unwrap_or_else(|_| filter.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Arc::new(system_log_file)),
        )
        .init();

    info!(path = %system_log_path.display(), "system log file");
    info!(
        registry = %settings.registry_url,
        callback = %settings.callback_url,
        port = settings.port,
        "effective configuration"
    );

    let allowed_commands = AllowedCommands::load(&settings.allowlist_path)
        .context("could not load allowed commands")?;

    let store = JobStore::new(&settings.db_path).context("could not create storage")?;
    let recovered = store
        .reset_in_progress_jobs()
        .context("could not reset in-progress jobs")?;
    if recovered > 0 {
        info!(count = recovered, "reset in-progress jobs back to pending");
    }
    let db = DbHandle::new(store);

    let docker =
        Docker::connect_with_socket_defaults().context("could not create docker client")?;
    if let Err(err) = session::reap_orphans(&docker).await {
        warn!(error = %err, "could not cleanup stale ephemeral BuildKit containers");
    }

    // Hourly retention sweep for old build logs.
    {
        let log_manager = log_manager.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(LOG_CLEANUP_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                if let Err(err) = log_manager.cleanup(LOG_RETENTION) {
                    error!(error = %err, "log cleanup failed");
                }
            }
        });
    }

    let settings = Arc::new(settings);
    let allowlist = Arc::new(allowed_commands);
    let callback = Arc::new(CallbackClient::new(&settings.callback_url));

    let deps = WorkerDeps {
        db: db.clone(),
        logs: log_manager.clone(),
        allowlist: allowlist.clone(),
        callback,
        docker,
        settings: settings.clone(),
    };
    let dispatcher = Dispatcher::new(deps);
    {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { dispatcher.run().await });
    }

    let state = Arc::new(AppState {
        db,
        logs: log_manager,
        dispatcher,
        allowlist,
    });

    server::serve(state, settings.port).await
}
