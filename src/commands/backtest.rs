use crate::config::MAX_HORIZON_DAYS;
use crate::context::AppContext;
use crate::models::InstrumentResult;
use anyhow::{anyhow, Context, Result};
use log::{info, warn};
use std::path::Path;

pub async fn run(app: &AppContext, days: Option<i64>, output: Option<&Path>) -> Result<()> {
    let days = days.unwrap_or(app.config().backtest_days);
    if days <= 0 || days > MAX_HORIZON_DAYS {
        return Err(anyhow!(
            "Backtest horizon must be between 1 and {} days (got {})",
            MAX_HORIZON_DAYS,
            days
        ));
    }

    let symbols = &app.config().symbols;
    info!(
        "Running {}-day backtest for {} instrument(s): {}",
        days,
        symbols.len(),
        symbols.join(", ")
    );
    let engine = app.backtest_engine().await?;
    let report = engine.run(symbols, days).await?;

    for (symbol, result) in &report {
        match result {
            InstrumentResult::Completed(outcome) => info!(
                "{}: final balance {:.2} (from {:.2}), {} trade(s), {} skipped bar(s)",
                symbol,
                outcome.balance,
                outcome.initial_balance,
                outcome.trades.len(),
                outcome.skipped_bars
            ),
            InstrumentResult::Failed { error } => warn!("{}: {}", symbol, error),
        }
    }

    if let Some(path) = output {
        let json = serde_json::to_string_pretty(&report).context("failed to serialize report")?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write backtest report to {}", path.display()))?;
        info!("Backtest report written to {}", path.display());
    }

    Ok(())
}
