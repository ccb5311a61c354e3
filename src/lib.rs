pub mod backtester;
pub mod commands;
pub mod config;
pub mod context;
pub mod cycle;
pub mod database;
pub mod error;
pub mod fetcher;
pub mod indicators;
pub mod models;
pub mod performance;
pub mod prediction;
pub mod providers;
pub mod rate_limiter;
pub mod retry;
pub mod store;
