//! CLI for Tally
//!
//! - push: send samples to the aggregator
//! - scrape: print the aggregator's exposition output

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::time::Duration;
use tally_shared::utils::parse_duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;
mod output;

#[derive(Parser)]
#[command(name = "tally")]
#[command(about = "Tally - multi-tenant metric ingestion", long_about = None)]
#[command(version)]
struct Cli {
    /// Aggregator base URL
    #[arg(long, global = true, env = "TALLY_URL", default_value = "http://127.0.0.1:8080")]
    url: String,

    /// Request timeout (e.g. 500ms, 10s)
    #[arg(long, global = true, default_value = "10s", value_parser = parse_duration)]
    timeout: Duration,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Push one sample or a JSON batch file
    Push(commands::push::PushArgs),

    /// Print the exposition document
    Scrape(commands::scrape::ScrapeArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let target = commands::Target {
        base_url: cli.url.trim_end_matches('/').to_string(),
        timeout: cli.timeout,
    };
    let result = match cli.command {
        Commands::Push(args) => commands::push::run(&target, args).await,
        Commands::Scrape(args) => commands::scrape::run(&target, args).await,
    };
    if let Err(e) = &result {
        output::error(&format!("{:#}", e));
    }
    result
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}
