use anyhow::Result;
use clap::{Parser, Subcommand};
use log::info;
use signal_engine::{
    commands::{backtest, run_cycle},
    config::AppConfig,
    context::AppContext,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "signal-engine")]
#[command(about = "Market-data ingestion, technical indicators and backtesting for trading signals")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay stored history for every configured instrument and report performance
    Backtest {
        /// Days of history to replay (defaults to BACKTEST_DAYS)
        #[arg(long)]
        days: Option<i64>,
        /// Write the full JSON report to this file
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
    /// Run one live decision cycle: fetch, enrich, score and persist a recommendation per instrument
    RunCycle,
}

#[tokio::main]
async fn main() -> Result<()> {
    let Cli { command } = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = AppConfig::from_env()?;
    let app_context = AppContext::initialize(config);

    info!("Starting signal engine. Not financial advice. Use at your own risk.");

    match command {
        Commands::Backtest { days, output } => {
            backtest::run(&app_context, days, output.as_deref()).await?;
        }
        Commands::RunCycle => {
            run_cycle::run(&app_context).await?;
        }
    }

    Ok(())
}
