use crate::models::{BacktestMetrics, Trade};
use statrs::statistics::Statistics;

pub struct PerformanceCalculator;

impl PerformanceCalculator {
    /// Metrics over the realized cash balance after each trade. `None` when
    /// no trade was made.
    pub fn calculate_metrics(trades: &[Trade], initial_balance: f64) -> Option<BacktestMetrics> {
        if trades.is_empty() {
            return None;
        }
        let balances: Vec<f64> = trades.iter().map(|trade| trade.balance).collect();
        let returns = Self::calculate_returns(&balances, initial_balance);
        Some(BacktestMetrics {
            sharpe_ratio: Self::calculate_sharpe_ratio(&returns),
            max_drawdown: Self::calculate_max_drawdown(&balances, initial_balance),
            returns,
        })
    }

    /// Fractional change between consecutive balances, the first one measured
    /// against the initial balance.
    pub fn calculate_returns(balances: &[f64], initial_balance: f64) -> Vec<f64> {
        let mut previous = initial_balance;
        balances
            .iter()
            .map(|&balance| {
                let change = if previous > 0.0 {
                    (balance - previous) / previous
                } else {
                    0.0
                };
                previous = balance;
                change
            })
            .collect()
    }

    /// Mean over population standard deviation, unannualized. Needs at least
    /// two returns and a non-zero deviation.
    pub fn calculate_sharpe_ratio(returns: &[f64]) -> Option<f64> {
        if returns.len() < 2 {
            return None;
        }
        let mean_return = returns.mean();
        let std_dev = returns.population_std_dev();
        if !std_dev.is_finite() || std_dev <= f64::EPSILON {
            return None;
        }
        let sharpe = mean_return / std_dev;
        sharpe.is_finite().then_some(sharpe)
    }

    /// Largest fractional decline from a running peak. The peak starts at the
    /// initial balance.
    pub fn calculate_max_drawdown(balances: &[f64], initial_balance: f64) -> f64 {
        let mut peak_value = initial_balance;
        let mut max_drawdown = 0.0;
        for &balance in balances {
            if balance > peak_value {
                peak_value = balance;
            }
            let drawdown = if peak_value > 0.0 {
                (peak_value - balance) / peak_value
            } else {
                0.0
            };
            if drawdown > max_drawdown {
                max_drawdown = drawdown;
            }
        }
        max_drawdown
    }
}
