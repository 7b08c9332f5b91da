use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use groupsync::config::GroupsyncConfig;

mod cmd;

#[derive(Parser)]
#[command(name = "groupsync")]
#[command(version, about = "Membership synchronization orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to groupsync.toml. Defaults to ./groupsync.toml when present.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Override the data directory (database, artifacts, run state).
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Register a sync job from a JSON definition file
    Add {
        file: PathBuf,
    },
    /// Approve a pending job so the scheduler may dispatch it
    Approve {
        job: Uuid,
    },
    /// Execute one run of a job now
    Run {
        job: Uuid,
        /// Part batch to run (1-based). Defaults to running every part.
        #[arg(long)]
        part: Option<u32>,
        /// Total number of part batches. Defaults to the query's part count.
        #[arg(long)]
        parts: Option<u32>,
    },
    /// Run the dispatch loop until stopped
    Daemon,
    List,
    Status {
        job: Uuid,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let mut config = GroupsyncConfig::load(cli.config.as_deref())?;
    if let Some(dir) = cli.data_dir {
        config = config.with_data_dir(dir);
    }
    config.ensure_directories()?;

    match cli.command {
        Commands::Add { file } => cmd::add(&config, &file).await,
        Commands::Approve { job } => cmd::approve(&config, job).await,
        Commands::Run { job, part, parts } => cmd::run(&config, job, part, parts).await,
        Commands::Daemon => cmd::daemon(&config).await,
        Commands::List => cmd::list(&config).await,
        Commands::Status { job } => cmd::status(&config, job).await,
    }
}
