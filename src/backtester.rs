use crate::config::TradingRules;
use crate::error::{EngineError, EngineResult};
use crate::indicators::compute_indicator_set;
use crate::models::{Bar, InstrumentReport, InstrumentResult, Trade, TradeAction};
use crate::performance::PerformanceCalculator;
use crate::prediction::{predict, Scorer};
use crate::store::Store;
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

pub type BacktestReport = BTreeMap<String, InstrumentResult>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BacktestPhase {
    Warmup,
    Trading,
    Closed,
}

/// Cash and holdings of one instrument's simulation.
#[derive(Debug, Clone, PartialEq)]
pub struct PortfolioState {
    pub cash_balance: f64,
    pub position_size: f64,
    pub trade_log: Vec<Trade>,
}

impl PortfolioState {
    pub fn new(initial_balance: f64) -> Self {
        Self {
            cash_balance: initial_balance,
            position_size: 0.0,
            trade_log: Vec::new(),
        }
    }

    /// Applies `action` at `price`. Returns whether a trade was made; a
    /// rejected action leaves the state untouched.
    pub fn execute(
        &mut self,
        action: TradeAction,
        price: f64,
        timestamp: DateTime<Utc>,
        rules: &TradingRules,
    ) -> bool {
        if !price.is_finite() || price <= 0.0 {
            return false;
        }
        match action {
            TradeAction::Buy if self.position_size <= 0.0 => {
                let amount = self.cash_balance * rules.trade_size_ratio;
                if amount <= 0.0 {
                    return false;
                }
                let shares = amount / price;
                self.position_size += shares;
                self.cash_balance -= amount;
                self.record(timestamp, action, price, shares);
                true
            }
            TradeAction::Sell if self.position_size > 0.0 => {
                let shares = self.position_size;
                self.cash_balance += shares * price;
                self.position_size = 0.0;
                self.record(timestamp, action, price, shares);
                true
            }
            _ => false,
        }
    }

    fn record(&mut self, timestamp: DateTime<Utc>, action: TradeAction, price: f64, shares: f64) {
        self.trade_log.push(Trade {
            timestamp,
            action,
            price,
            shares,
            balance: self.cash_balance,
        });
    }
}

/// Replays one instrument's bars: the first `warmup_bars` only feed the
/// indicators, then every bar is scored on the prefix ending at it.
pub struct InstrumentSimulation<'a, M: ?Sized> {
    symbol: &'a str,
    scorer: &'a M,
    rules: &'a TradingRules,
    sentiment: f64,
    phase: BacktestPhase,
    portfolio: PortfolioState,
    skipped_bars: usize,
}

impl<'a, M: Scorer + ?Sized> InstrumentSimulation<'a, M> {
    pub fn new(symbol: &'a str, scorer: &'a M, rules: &'a TradingRules, sentiment: f64) -> Self {
        Self {
            symbol,
            scorer,
            rules,
            sentiment,
            phase: BacktestPhase::Warmup,
            portfolio: PortfolioState::new(rules.initial_balance),
            skipped_bars: 0,
        }
    }

    pub fn phase(&self) -> BacktestPhase {
        self.phase
    }

    pub fn portfolio(&self) -> &PortfolioState {
        &self.portfolio
    }

    pub fn run(mut self, bars: &[Bar]) -> InstrumentReport {
        for index in 0..bars.len() {
            self.step(bars, index);
        }
        self.close()
    }

    /// Processes bar `index` of `bars`. No-op once closed.
    pub fn step(&mut self, bars: &[Bar], index: usize) {
        if self.phase == BacktestPhase::Closed {
            return;
        }
        if index < self.rules.warmup_bars {
            return;
        }
        self.phase = BacktestPhase::Trading;

        let bar = &bars[index];
        match self.evaluate(&bars[..=index]) {
            Ok(signal) => {
                let action = TradeAction::from_prediction(signal, self.rules);
                if self.portfolio.execute(action, bar.close, bar.timestamp, self.rules) {
                    info!(
                        "{} {} {:.4} shares at {:.2} on {}",
                        self.symbol,
                        action.as_str(),
                        self.portfolio
                            .trade_log
                            .last()
                            .map_or(0.0, |trade| trade.shares),
                        bar.close,
                        bar.timestamp
                    );
                }
            }
            Err(err) => {
                warn!("Backtest error for {} at {}: {}", self.symbol, bar.timestamp, err);
                self.skipped_bars += 1;
            }
        }
    }

    fn evaluate(&self, prefix: &[Bar]) -> EngineResult<f64> {
        let enriched = compute_indicator_set(prefix)?;
        predict(&enriched, self.sentiment, self.scorer)
    }

    /// Ends the replay and reports the final portfolio. Later steps are ignored.
    pub fn close(&mut self) -> InstrumentReport {
        self.phase = BacktestPhase::Closed;
        let metrics =
            PerformanceCalculator::calculate_metrics(&self.portfolio.trade_log, self.rules.initial_balance);
        InstrumentReport {
            initial_balance: self.rules.initial_balance,
            balance: self.portfolio.cash_balance,
            position: self.portfolio.position_size,
            trades: self.portfolio.trade_log.clone(),
            metrics,
            skipped_bars: self.skipped_bars,
        }
    }
}

/// Historical replay over every configured instrument.
pub struct BacktestEngine<S, M> {
    store: Arc<S>,
    scorer: Arc<M>,
    rules: Arc<TradingRules>,
    sentiment: f64,
}

impl<S: Store, M: Scorer + 'static> BacktestEngine<S, M> {
    pub fn new(store: Arc<S>, scorer: M, rules: TradingRules, sentiment: f64) -> Self {
        Self {
            store,
            scorer: Arc::new(scorer),
            rules: Arc::new(rules),
            sentiment,
        }
    }

    /// Loads each instrument's history, then simulates them in parallel. A
    /// missing history becomes that instrument's error entry; only store
    /// failures abort the run.
    pub async fn run(&self, symbols: &[String], days: i64) -> EngineResult<BacktestReport> {
        let started = Instant::now();
        let mut report = BacktestReport::new();
        let mut loaded = Vec::with_capacity(symbols.len());

        for symbol in symbols {
            match self.store.get_history(symbol, days).await? {
                Some(bars) if bars.len() > self.rules.warmup_bars => {
                    info!("Loaded {} bars for {}", bars.len(), symbol);
                    loaded.push((symbol.clone(), bars));
                }
                Some(bars) if !bars.is_empty() => {
                    let err = EngineError::InsufficientHistory {
                        required: self.rules.warmup_bars + 1,
                        actual: bars.len(),
                    };
                    error!("Skipping backtest for {}: {}", symbol, err);
                    report.insert(symbol.clone(), InstrumentResult::failed(err.to_string()));
                }
                _ => {
                    let err = EngineError::NoDataAvailable(symbol.clone());
                    error!("Skipping backtest for {}: {}", symbol, err);
                    report.insert(symbol.clone(), InstrumentResult::failed(err.to_string()));
                }
            }
        }

        let scorer = Arc::clone(&self.scorer);
        let rules = Arc::clone(&self.rules);
        let sentiment = self.sentiment;
        let simulated: Vec<(String, InstrumentReport)> = tokio::task::spawn_blocking(move || {
            loaded
                .into_par_iter()
                .map(|(symbol, bars)| {
                    let result =
                        InstrumentSimulation::new(&symbol, scorer.as_ref(), rules.as_ref(), sentiment)
                            .run(&bars);
                    (symbol, result)
                })
                .collect()
        })
        .await
        .map_err(|err| EngineError::Permanent(format!("backtest simulation task failed: {}", err)))?;

        for (symbol, result) in simulated {
            info!(
                "Backtest {}: {} trades, balance {:.2}, position {:.4}, sharpe {}, max drawdown {:.2}%",
                symbol,
                result.trades.len(),
                result.balance,
                result.position,
                result
                    .metrics
                    .as_ref()
                    .and_then(|m| m.sharpe_ratio)
                    .map_or_else(|| "n/a".to_string(), |s| format!("{:.2}", s)),
                result.metrics.as_ref().map_or(0.0, |m| m.max_drawdown) * 100.0
            );
            report.insert(symbol, InstrumentResult::Completed(result));
        }

        info!(
            "Backtest of {} instrument(s) finished in {:.1}s",
            symbols.len(),
            started.elapsed().as_secs_f64()
        );
        Ok(report)
    }
}
