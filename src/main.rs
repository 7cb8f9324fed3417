use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use bili_claw::config::Config;
use bili_claw::crawler::Crawler;

#[derive(Parser, Debug)]
#[command(
    name = "bili-claw",
    about = "Resumable keyword crawler streaming videos, comments and accounts to Kafka"
)]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Fatal error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    init_tracing()?;

    let cli = Cli::parse();
    let config = Config::from_file(&cli.config)
        .with_context(|| format!("failed to load configuration from {}", cli.config.display()))?;
    info!(path = %cli.config.display(), keyword = %config.keyword, "configuration loaded");

    let crawler = Crawler::new(config).context("failed to initialize crawler")?;
    crawler.run().await
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .context("failed to initialize tracing")?;
    Ok(())
}
