//! Outpost manager binary
//!
//! Runs the task queues, the tunnel session manager, the housekeeper and the
//! HTTP API in one process. `purge` and `summary` operate directly on the
//! database for maintenance from a shell.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand, ValueEnum};
use outpost_api::{ApiServer, ApiServerConfig};
use outpost_control::{
    AgentRegistry, HttpProbe, SshTunnelLauncher, TunnelConfig, TunnelSessionManager,
};
use outpost_housekeeper::{Housekeeper, HousekeeperConfig};
use outpost_queue::{RetentionPolicy, StuckPolicy, TaskDispatcher};
use outpost_router::ProxyRegistry;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser, Debug)]
#[command(name = "outpost")]
#[command(about = "Task queues and on-demand tunnels for agents behind firewalls", long_about = None)]
#[command(version = concat!(env!("CARGO_PKG_VERSION"), " (", env!("GIT_HASH"), ", built ", env!("BUILD_TIME"), ")"))]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Database connection string (SQLite file, PostgreSQL or "sqlite::memory:")
    #[arg(
        long,
        global = true,
        env = "DATABASE_URL",
        default_value = "sqlite://./outpost.db?mode=rwc"
    )]
    database_url: String,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, global = true, env = "OUTPOST_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Log output format
    #[arg(
        long,
        global = true,
        env = "OUTPOST_LOG_FORMAT",
        value_enum,
        default_value_t = LogFormat::Pretty
    )]
    log_format: LogFormat,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the manager: API, tunnel sessions and housekeeping (default)
    Serve(ServeArgs),
    /// Delete terminal tasks and terminated sessions past their retention window
    Purge(RetentionArgs),
    /// Print per-queue status counts as JSON
    Summary(SummaryArgs),
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

#[derive(Parser, Debug)]
struct ServeArgs {
    /// Address the HTTP API and public proxy listen on
    #[arg(long, env = "OUTPOST_API_ADDR", default_value = "127.0.0.1:3080")]
    api_addr: SocketAddr,

    /// Public base URL that tunnel links are built from
    #[arg(long, env = "OUTPOST_PUBLIC_URL", default_value = "http://127.0.0.1:3080")]
    public_url: String,

    /// Enable CORS for a local dashboard on port 3000
    #[arg(long, env = "OUTPOST_ENABLE_CORS")]
    enable_cors: bool,

    /// JSON file listing known agents and their tunnel hosts
    #[arg(long, env = "OUTPOST_AGENTS")]
    agents: Option<PathBuf>,

    #[command(flatten)]
    tunnels: TunnelArgs,

    #[command(flatten)]
    stuck: StuckArgs,

    #[command(flatten)]
    retention: RetentionArgs,

    /// Seconds between housekeeping runs
    #[arg(long, env = "OUTPOST_HOUSEKEEPING_INTERVAL_SECS", default_value_t = 300, value_parser = clap::value_parser!(u64).range(1..))]
    housekeeping_interval_secs: u64,
}

#[derive(Parser, Debug)]
struct SummaryArgs {
    #[command(flatten)]
    stuck: StuckArgs,

    #[command(flatten)]
    retention: RetentionArgs,
}

#[derive(Args, Debug)]
struct TunnelArgs {
    /// Local port pool, inclusive ("START-END")
    #[arg(long, env = "OUTPOST_PORT_RANGE", default_value = "8100-8199", value_parser = parse_port_range)]
    port_range: (u16, u16),

    /// Skip pool ports another process already listens on
    #[arg(long, env = "OUTPOST_VERIFY_OS_PORTS")]
    verify_os_ports: bool,

    /// Tunnel program to launch (defaults to ssh with local forwarding)
    #[arg(long, env = "OUTPOST_TUNNEL_PROGRAM", default_value = "ssh")]
    tunnel_program: String,

    /// Argument template for the tunnel program, repeated per argument.
    /// {port}, {host}, {target} and {agent} are substituted.
    #[arg(long = "tunnel-arg", allow_hyphen_values = true)]
    tunnel_args: Vec<String>,

    /// Directory for tunnel pid files
    #[arg(long, env = "OUTPOST_RUN_DIR", default_value = "./run")]
    run_dir: PathBuf,

    /// Expire sessions without activity for this many seconds
    #[arg(long, env = "OUTPOST_IDLE_TIMEOUT_SECS", default_value_t = 900, value_parser = clap::value_parser!(i64).range(1..))]
    idle_timeout_secs: i64,

    /// Expire sessions this many seconds after creation
    #[arg(long, env = "OUTPOST_MAX_LIFETIME_SECS", default_value_t = 1800, value_parser = clap::value_parser!(i64).range(1..))]
    max_lifetime_secs: i64,

    /// Mark active sessions idle after this many seconds without activity
    #[arg(long, env = "OUTPOST_IDLE_AFTER_SECS", default_value_t = 120, value_parser = clap::value_parser!(i64).range(1..))]
    idle_after_secs: i64,

    /// Upper bound in seconds for establishing a tunnel
    #[arg(long, env = "OUTPOST_SETUP_TIMEOUT_SECS", default_value_t = 5, value_parser = clap::value_parser!(u64).range(1..))]
    setup_timeout_secs: u64,
}

#[derive(Args, Debug)]
struct StuckArgs {
    /// Fail tasks still pending this many seconds after creation
    #[arg(long, env = "OUTPOST_PENDING_GRACE_SECS", default_value_t = 3600, value_parser = clap::value_parser!(i64).range(1..))]
    pending_grace_secs: i64,

    /// Fail tasks still sent this many seconds after delivery
    #[arg(long, env = "OUTPOST_SENT_GRACE_SECS", default_value_t = 1800, value_parser = clap::value_parser!(i64).range(1..))]
    sent_grace_secs: i64,
}

#[derive(Parser, Debug)]
struct RetentionArgs {
    /// Keep completed tasks this many days
    #[arg(long, env = "OUTPOST_COMPLETED_RETENTION_DAYS", default_value_t = 7, value_parser = clap::value_parser!(i64).range(0..=36_500))]
    completed_retention_days: i64,

    /// Keep failed and cancelled tasks this many days
    #[arg(long, env = "OUTPOST_FAILED_RETENTION_DAYS", default_value_t = 14, value_parser = clap::value_parser!(i64).range(0..=36_500))]
    failed_retention_days: i64,

    /// Keep terminated tunnel sessions this many days
    #[arg(long, env = "OUTPOST_SESSION_RETENTION_DAYS", default_value_t = 14, value_parser = clap::value_parser!(i64).range(0..=36_500))]
    session_retention_days: i64,
}

fn parse_port_range(s: &str) -> Result<(u16, u16), String> {
    let (start, end) = s
        .split_once('-')
        .ok_or_else(|| format!("expected START-END, got '{}'", s))?;
    let start: u16 = start
        .trim()
        .parse()
        .map_err(|e| format!("invalid start port '{}': {}", start, e))?;
    let end: u16 = end
        .trim()
        .parse()
        .map_err(|e| format!("invalid end port '{}': {}", end, e))?;
    if start == 0 || start > end {
        return Err(format!("invalid port range {}-{}", start, end));
    }
    Ok((start, end))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level, cli.log_format)?;

    let command = cli
        .command
        .unwrap_or_else(|| Commands::Serve(ServeArgs::parse_from(["outpost"])));

    match command {
        Commands::Serve(args) => serve(&cli.database_url, args).await,
        Commands::Purge(args) => purge(&cli.database_url, args).await,
        Commands::Summary(args) => summary(&cli.database_url, args).await,
    }
}

fn init_logging(log_level: &str, format: LogFormat) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .context("Failed to initialize logging filter")?;

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }

    Ok(())
}

async fn open_database(database_url: &str) -> Result<sea_orm::DatabaseConnection> {
    let db = outpost_db::connect(database_url)
        .await
        .with_context(|| format!("Failed to connect to database {}", database_url))?;
    outpost_db::migrate(&db)
        .await
        .context("Failed to run database migrations")?;
    Ok(db)
}

impl StuckArgs {
    fn policy(&self) -> StuckPolicy {
        StuckPolicy {
            pending_grace: chrono::Duration::seconds(self.pending_grace_secs),
            sent_grace: chrono::Duration::seconds(self.sent_grace_secs),
        }
    }
}

impl RetentionArgs {
    fn task_policy(&self) -> RetentionPolicy {
        RetentionPolicy::from_days(self.completed_retention_days, self.failed_retention_days)
    }

    fn session_retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.session_retention_days)
    }
}

impl TunnelArgs {
    fn config(&self) -> TunnelConfig {
        TunnelConfig {
            port_range_start: self.port_range.0,
            port_range_end: self.port_range.1,
            verify_os_ports: self.verify_os_ports,
            idle_timeout: chrono::Duration::seconds(self.idle_timeout_secs),
            max_lifetime: chrono::Duration::seconds(self.max_lifetime_secs),
            idle_after: chrono::Duration::seconds(self.idle_after_secs),
            setup_timeout: std::time::Duration::from_secs(self.setup_timeout_secs),
        }
    }

    fn launcher(&self) -> SshTunnelLauncher {
        if self.tunnel_args.is_empty() && self.tunnel_program == "ssh" {
            SshTunnelLauncher::ssh(self.run_dir.clone())
        } else {
            SshTunnelLauncher::new(
                self.tunnel_program.clone(),
                self.tunnel_args.clone(),
                self.run_dir.clone(),
            )
        }
    }
}

async fn serve(database_url: &str, args: ServeArgs) -> Result<()> {
    info!(
        "Starting outpost {} ({}, built {})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIME")
    );

    let db = open_database(database_url).await?;

    let agents = match &args.agents {
        Some(path) => {
            let registry = AgentRegistry::load(path)
                .with_context(|| format!("Failed to load agents from {}", path.display()))?;
            info!("Loaded {} agents from {}", registry.count(), path.display());
            Arc::new(registry)
        }
        None => {
            warn!("No agent file configured; every enqueue and connect will be rejected");
            Arc::new(AgentRegistry::new())
        }
    };

    let dispatcher = TaskDispatcher::new(db.clone(), agents.clone())
        .with_stuck_policy(args.stuck.policy())
        .with_retention_policy(args.retention.task_policy());

    std::fs::create_dir_all(&args.tunnels.run_dir).with_context(|| {
        format!(
            "Failed to create run directory {}",
            args.tunnels.run_dir.display()
        )
    })?;

    let config = args.tunnels.config();
    info!(
        "Tunnel port pool {}-{}, idle timeout {}s, max lifetime {}s",
        config.port_range_start,
        config.port_range_end,
        config.idle_timeout.num_seconds(),
        config.max_lifetime.num_seconds()
    );

    let sessions = Arc::new(
        TunnelSessionManager::new(
            db,
            config,
            Arc::new(ProxyRegistry::new(args.public_url.clone())),
            Arc::new(args.tunnels.launcher()),
            Arc::new(HttpProbe::default()),
            agents,
        )
        .context("Failed to initialize tunnel session manager")?,
    );

    let restored = sessions
        .restore()
        .await
        .context("Failed to restore tunnel sessions")?;
    info!(
        "Restored {} sessions ({} failed, {} already terminated, {} left for reconcile)",
        restored.restored, restored.failed, restored.terminated, restored.failures
    );

    let housekeeper = Arc::new(Housekeeper::new(
        dispatcher.clone(),
        sessions.clone(),
        HousekeeperConfig {
            interval: std::time::Duration::from_secs(args.housekeeping_interval_secs),
            session_retention: args.retention.session_retention(),
        },
    ));
    let housekeeper_handle = housekeeper.spawn();

    let server = ApiServer::new(
        ApiServerConfig {
            bind_addr: args.api_addr,
            enable_cors: args.enable_cors,
        },
        dispatcher,
        sessions,
    );

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Shutting down");
    };

    let result = server.start(shutdown).await;
    housekeeper_handle.abort();
    result
}

async fn purge(database_url: &str, args: RetentionArgs) -> Result<()> {
    let db = open_database(database_url).await?;
    let now = Utc::now();

    let policy = args.task_policy();
    let dispatcher = TaskDispatcher::new(db.clone(), Arc::new(AgentRegistry::new()))
        .with_retention_policy(policy);
    let tasks = dispatcher
        .purge(now, &policy)
        .await
        .context("Failed to purge tasks")?;

    let sessions = outpost_control::purge_terminated_sessions(&db, now, args.session_retention())
        .await
        .context("Failed to purge tunnel sessions")?;

    let output = serde_json::json!({
        "tasks": tasks,
        "tasks_total": tasks.total(),
        "sessions": sessions,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn summary(database_url: &str, args: SummaryArgs) -> Result<()> {
    let db = open_database(database_url).await?;
    let dispatcher = TaskDispatcher::new(db, Arc::new(AgentRegistry::new()))
        .with_stuck_policy(args.stuck.policy())
        .with_retention_policy(args.retention.task_policy());

    let summary = dispatcher
        .summary(Utc::now())
        .await
        .context("Failed to summarize queues")?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
