pub mod backtest;
pub mod run_cycle;
