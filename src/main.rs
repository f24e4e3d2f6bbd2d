use anyhow::{Context as _, Result};
use async_trait::async_trait;
use canaryd::{
    config::{Overrides, SamplingMode, Settings},
    error::NotifyError,
    health::HealthMonitor,
    notifier::{NotificationTransport, Notifier, SlackTransport},
    probe::HttpServiceProbe,
    rest,
    sampler::PgSampler,
    scheduler::Scheduler,
    validator::Validator,
    CanaryContext,
};
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(
    name = "canaryd",
    about = "Materialization consistency canary — samples annotation rows and alerts on drift",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to the TOML config file (default: ./canary.toml)
    #[arg(long, env = "CANARY_CONFIG")]
    config: Option<std::path::PathBuf>,

    /// Datastack being watched (e.g. minnie65_phase3)
    #[arg(long, env = "CANARY_DATASTACK")]
    datastack: Option<String>,

    /// Base URL of the materialization service
    #[arg(long, env = "CANARY_SERVER_ADDRESS")]
    server_address: Option<String>,

    /// Postgres connection string for the materialized store
    #[arg(long, env = "CANARY_DATABASE_URL")]
    database_url: Option<String>,

    /// Comparison table or view to sample
    #[arg(long, env = "CANARY_TABLE")]
    table: Option<String>,

    /// Slack bot token (prefer the env var over the flag)
    #[arg(long, env = "CANARY_SLACK_TOKEN", hide_env_values = true)]
    slack_token: Option<String>,

    /// Slack channel to alert (e.g. "#data-infrastructure")
    #[arg(long, env = "CANARY_SLACK_CHANNEL")]
    slack_channel: Option<String>,

    /// Rows drawn per check cycle
    #[arg(long, env = "CANARY_SAMPLE_SIZE")]
    sample_size: Option<u64>,

    /// Seconds between check cycles
    #[arg(long, env = "CANARY_CHECK_INTERVAL")]
    check_interval: Option<u64>,

    /// Sampling strategy: "system-rows" | "random-offset" (default)
    #[arg(long, env = "CANARY_SAMPLING_MODE")]
    sampling_mode: Option<SamplingMode>,

    /// Bind address for the /health endpoint (default: 127.0.0.1)
    #[arg(long, env = "CANARY_BIND")]
    bind_address: Option<String>,

    /// Port for the /health endpoint (default: 4310)
    #[arg(long, env = "CANARY_PORT")]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "CANARY_LOG")]
    log: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "CANARY_LOG_FILE")]
    log_file: Option<std::path::PathBuf>,

    /// Log output format: "pretty" (default) | "json"
    #[arg(long, env = "CANARY_LOG_FORMAT")]
    log_format: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the canary daemon (default when no subcommand given).
    ///
    /// Starts the check loop and the /health endpoint, runs until interrupted.
    Serve,
    /// Run exactly one check cycle in the foreground and exit.
    ///
    /// Prints the result. Exit code 0 if the check passed, 1 otherwise.
    /// No alert is sent — this is for smoke tests and CI.
    Check,
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            datastack: self.datastack.clone(),
            server_address: self.server_address.clone(),
            database_url: self.database_url.clone(),
            table: self.table.clone(),
            slack_token: self.slack_token.clone(),
            slack_channel: self.slack_channel.clone(),
            sample_size: self.sample_size,
            check_interval_secs: self.check_interval,
            sampling_mode: self.sampling_mode,
            bind_address: self.bind_address.clone(),
            port: self.port,
            log: self.log.clone(),
            log_format: self.log_format.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Settings first — an invalid config is the only thing allowed to kill
    // the process, and it must do so with a clear message and non-zero exit.
    let settings = Settings::resolve(args.config.as_deref(), args.overrides())
        .map(Arc::new)
        .context("invalid configuration")?;

    // Init once — must happen before any tracing calls.
    let _file_guard = setup_logging(&settings.log, args.log_file.as_deref(), &settings.log_format);

    match args.command {
        Some(Command::Check) => {
            let scheduler = build_scheduler(&settings, false).await?;
            let result = scheduler.run_cycle().await;
            println!("{}: {}", result.outcome, if result.detail.is_empty() {
                "sample consistent"
            } else {
                result.detail.as_str()
            });
            std::process::exit(if result.outcome.is_ok() { 0 } else { 1 });
        }
        None | Some(Command::Serve) => run_server(settings).await,
    }
}

async fn run_server(settings: Arc<Settings>) -> Result<()> {
    info!(
        datastack = %settings.datastack,
        sample_size = settings.sample_size,
        interval_secs = settings.check_interval.as_secs(),
        "canaryd starting"
    );

    let scheduler = build_scheduler(&settings, true).await?;
    let monitor = scheduler.monitor().clone();
    let _scheduler_handle = scheduler.spawn();

    let ctx = Arc::new(CanaryContext {
        settings: settings.clone(),
        monitor,
        started_at: std::time::Instant::now(),
    });

    tokio::select! {
        result = rest::serve(ctx) => result.context("health endpoint failed")?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }
    Ok(())
}

/// Wire probe, sampler, validator, monitor, and notifier into a scheduler.
///
/// Establishing initial database connectivity happens here and is fatal —
/// after startup, every database failure is absorbed into check results.
async fn build_scheduler(settings: &Arc<Settings>, alerting: bool) -> Result<Arc<Scheduler>> {
    let pool = PgPoolOptions::new()
        .max_connections(2)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&settings.database_url)
        .await
        .context("failed to establish initial database connectivity")?;

    let probe = Arc::new(
        HttpServiceProbe::new(&settings.server_address)
            .context("failed to build service probe")?,
    );
    let sampler = Arc::new(PgSampler::new(
        pool,
        &settings.table,
        settings.sampling_mode,
    ));

    let transport: Arc<dyn NotificationTransport> = if alerting {
        Arc::new(SlackTransport::new(&settings.slack_token).context("failed to build Slack client")?)
    } else {
        Arc::new(SilentTransport)
    };
    let notifier = Arc::new(Notifier::new(
        transport,
        &settings.slack_channel,
        &settings.datastack,
    ));

    Ok(Arc::new(Scheduler::new(
        settings,
        probe,
        sampler,
        Validator::standard(),
        HealthMonitor::new(),
        notifier,
    )))
}

/// Transport for `canaryd check` — the one-shot command reports to stdout,
/// not to the on-call channel.
struct SilentTransport;

#[async_trait]
impl NotificationTransport for SilentTransport {
    async fn post_message(&self, _channel: &str, _text: &str) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// Initialize the tracing subscriber.
/// If `log_file` is set, logs go to both stdout and a daily-rolling file.
/// Returns a `WorkerGuard` that must stay alive for the process lifetime.
///
/// `log_format` may be `"pretty"` (default, human-readable compact format) or
/// `"json"` (structured JSON for log aggregators).
///
/// If the log directory cannot be created, falls back to stdout-only logging
/// with a warning — never panics.
fn setup_logging(
    log_level: &str,
    log_file: Option<&std::path::Path>,
    log_format: &str,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let use_json = log_format == "json";

    if let Some(path) = log_file {
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let filename = path
            .file_name()
            .unwrap_or_else(|| std::ffi::OsStr::new("canaryd.log"));

        // Ensure the directory exists before tracing-appender tries to open it.
        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!(
                "warn: could not create log directory '{}': {e} — falling back to stdout",
                dir.display()
            );
            if use_json {
                tracing_subscriber::fmt().json().with_env_filter(log_level).init();
            } else {
                tracing_subscriber::fmt().with_env_filter(log_level).compact().init();
            }
            return None;
        }

        let appender = tracing_appender::rolling::daily(dir, filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        if use_json {
            tracing_subscriber::registry()
                .with(EnvFilter::new(log_level))
                .with(fmt::layer().json())
                .with(fmt::layer().json().with_writer(non_blocking))
                .init();
        } else {
            tracing_subscriber::registry()
                .with(EnvFilter::new(log_level))
                .with(fmt::layer().compact())
                .with(fmt::layer().with_writer(non_blocking))
                .init();
        }

        Some(guard)
    } else if use_json {
        tracing_subscriber::fmt().json().with_env_filter(log_level).init();
        None
    } else {
        tracing_subscriber::fmt().with_env_filter(log_level).compact().init();
        None
    }
}
