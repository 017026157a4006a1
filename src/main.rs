use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use onion::config::HarnessConfig;
use onion::consistency::ComparisonMode;
use onion::runner::Harness;

#[derive(Debug, Parser)]
#[command(author, version, about = "Compare content-gateway layers against a reference", long_about = None)]
struct Cli {
    /// Path to the TOML harness configuration
    #[arg(long, default_value = "config/onion.toml")]
    config: PathBuf,

    /// Tab-separated access log the requests are replayed from
    #[arg(long)]
    replay_file: PathBuf,

    /// Number of unique paths to test
    #[arg(long)]
    count: usize,

    /// Number of rounds to run over the same paths
    #[arg(long)]
    rounds: u32,

    /// Directory receiving `results-<round>` report directories
    #[arg(long, default_value = ".")]
    output_dir: PathBuf,

    /// Override the number of paths in flight
    #[arg(long)]
    concurrency: Option<usize>,

    /// Compare status codes only
    #[arg(long)]
    status_only: bool,

    /// Run identifier used to group pushed metrics; random when omitted
    #[arg(long)]
    run_id: Option<Uuid>,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    if cli.count == 0 {
        bail!("--count must be greater than zero");
    }
    if cli.rounds == 0 {
        bail!("--rounds must be greater than zero");
    }

    let mut config = HarnessConfig::load(&cli.config)
        .with_context(|| format!("failed to load config {}", cli.config.display()))?;
    if let Some(concurrency) = cli.concurrency {
        config.concurrency = concurrency;
    }
    if cli.status_only {
        config.mode = ComparisonMode::StatusOnly;
    }

    let run_id = cli.run_id.unwrap_or_else(Uuid::new_v4);
    let harness = Harness::new(config, &cli.output_dir, run_id)
        .with_context(|| format!("invalid config {}", cli.config.display()))?;
    let requests = harness
        .load_requests(&cli.replay_file, cli.count)
        .with_context(|| format!("failed to prepare requests from {}", cli.replay_file.display()))?;

    info!(target = "onion", %run_id, rounds = cli.rounds, "starting run");
    let outcomes = harness.run(&requests, cli.rounds).await?;
    for outcome in &outcomes {
        info!(
            target = "onion",
            round = outcome.round,
            dir = %outcome.dir.display(),
            "round complete"
        );
    }
    Ok(())
}
