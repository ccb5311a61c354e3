use crate::context::AppContext;
use crate::retry::cancel_pair;
use anyhow::Result;
use log::{info, warn};

pub async fn run(app: &AppContext) -> Result<()> {
    info!("Starting decision cycle");
    let cycle = app.decision_cycle().await?;

    let (handle, signal) = cancel_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling decision cycle");
            handle.cancel();
        }
    });

    let outcomes = cycle.run_decision_cycle(Some(&signal)).await?;
    for outcome in &outcomes {
        if let Some(error) = &outcome.error {
            warn!("{} skipped: {}", outcome.symbol, error);
        }
    }
    info!("Completed decision cycle");
    Ok(())
}
