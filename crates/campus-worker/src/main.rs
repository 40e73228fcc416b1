//! Campus worker - runs and feeds the email notification queue
//!
//! # Usage
//!
//! ```bash
//! # Process jobs until Ctrl+C / SIGTERM
//! campus-worker run
//!
//! # Queue a reminder, urgent or delayed
//! campus-worker enqueue --to student@campus.edu --subject "Event reminder" --urgent
//! campus-worker enqueue --to student@campus.edu --subject "Tomorrow" --delay-ms 60000
//!
//! # Show job counts per state
//! campus-worker stats
//! ```
//!
//! Tunables come from `CAMPUS_QUEUE_*` environment variables.

use anyhow::{Context, Result};
use campus_persist::{connect, SqliteConfig, SqliteQueueBackend};
use campus_queue::QueueSettings;
use clap::{Parser, Subcommand};
use std::sync::Arc;

mod commands;

use commands::{enqueue, run, stats};

#[derive(Parser)]
#[command(
    name = "campus-worker",
    version,
    about = "Background email jobs for the campus events platform"
)]
struct Cli {
    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Overrides CAMPUS_QUEUE_DATABASE_URL
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process queued jobs until interrupted
    #[command(name = "run")]
    Run(run::RunArgs),

    /// Add an email job to the queue
    #[command(name = "enqueue")]
    Enqueue(enqueue::EnqueueArgs),

    /// Show queue counts, or one job
    #[command(name = "stats")]
    Stats(stats::StatsArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let mut settings = QueueSettings::from_env().context("Loading queue configuration")?;
    if let Some(url) = cli.database_url {
        settings.database_url = url;
    }

    match cli.command {
        Commands::Run(args) => run::run(args, settings).await,
        Commands::Enqueue(args) => enqueue::run(args, settings).await,
        Commands::Stats(args) => stats::run(args, settings).await,
    }
}

/// Setup logging based on verbosity level
fn setup_logging(verbosity: u8) {
    use tracing_subscriber::EnvFilter;

    let filter = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();
}

/// Open the shared queue store described by `settings`
pub(crate) async fn open_backend(settings: &QueueSettings) -> Result<Arc<SqliteQueueBackend>> {
    let pool = connect(&SqliteConfig::new(&settings.database_url))
        .await
        .with_context(|| format!("Opening queue store at {}", settings.database_url))?;
    Ok(Arc::new(SqliteQueueBackend::new(pool, settings.retry_policy())))
}
