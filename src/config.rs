use crate::error::{EngineError, EngineResult};
use crate::retry::RetryPolicy;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_SYMBOLS: [&str; 5] = ["SPY", "AAPL", "MSFT", "GOOGL", "AMZN"];
const DEFAULT_NEWS_QUERIES: [(&str, &str); 5] = [
    ("SPY", "S&P 500 OR stock market"),
    ("AAPL", "Apple OR AAPL"),
    ("MSFT", "Microsoft OR MSFT"),
    ("GOOGL", "Google OR Alphabet OR GOOGL"),
    ("AMZN", "Amazon OR AMZN"),
];
const NEWS_QUERY_PREFIX: &str = "NEWS_QUERY_";
const DEFAULT_POLYGON_BASE_URL: &str = "https://api.polygon.io";
const DEFAULT_NEWS_API_BASE_URL: &str = "https://newsapi.org";
const DEFAULT_MODEL_PATH: &str = "enhanced_model.json";
/// Longest accepted backtest or lookback horizon.
pub const MAX_HORIZON_DAYS: i64 = 36_500;

/// Policy knobs of the trade-execution rule.
#[derive(Debug, Clone)]
pub struct TradingRules {
    pub buy_threshold: f64,
    pub sell_threshold: f64,
    /// Fraction of the current cash balance committed by a BUY.
    pub trade_size_ratio: f64,
    pub initial_balance: f64,
    pub warmup_bars: usize,
}

impl Default for TradingRules {
    fn default() -> Self {
        Self {
            buy_threshold: 0.55,
            sell_threshold: 0.45,
            trade_size_ratio: 0.10,
            initial_balance: 10_000.0,
            warmup_bars: 30,
        }
    }
}

/// Process-wide configuration, built once at start-up and passed by reference.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub symbols: Vec<String>,
    pub news_queries: HashMap<String, String>,
    pub max_calls_per_minute: u32,
    pub backtest_days: i64,
    pub live_lookback_days: i64,
    pub database_url: Option<String>,
    pub polygon_api_key: Option<String>,
    pub news_api_key: Option<String>,
    pub polygon_base_url: String,
    pub news_api_base_url: String,
    pub model_path: PathBuf,
    pub retry: RetryPolicy,
    pub trading: TradingRules,
    pub backtest_sentiment: f64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            symbols: DEFAULT_SYMBOLS.iter().map(|s| s.to_string()).collect(),
            news_queries: default_news_queries(),
            max_calls_per_minute: 5,
            backtest_days: 365,
            live_lookback_days: 1,
            database_url: None,
            polygon_api_key: None,
            news_api_key: None,
            polygon_base_url: DEFAULT_POLYGON_BASE_URL.to_string(),
            news_api_base_url: DEFAULT_NEWS_API_BASE_URL.to_string(),
            model_path: PathBuf::from(DEFAULT_MODEL_PATH),
            retry: RetryPolicy::default(),
            trading: TradingRules::default(),
            backtest_sentiment: 0.0,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> EngineResult<Self> {
        let settings: HashMap<String, String> = std::env::vars().collect();
        Self::from_settings_map(&settings)
    }

    pub fn from_settings_map(settings: &HashMap<String, String>) -> EngineResult<Self> {
        let defaults = Self::default();

        let symbols = match optional_setting(settings, "SYMBOLS") {
            Some(raw) => parse_symbol_list(raw),
            None => defaults.symbols.clone(),
        };
        if symbols.is_empty() {
            return Err(config_error("SYMBOLS must list at least one instrument"));
        }

        let mut news_queries = defaults.news_queries.clone();
        for (key, value) in settings {
            if let Some(symbol) = key.strip_prefix(NEWS_QUERY_PREFIX) {
                let query = value.trim();
                if !symbol.is_empty() && !query.is_empty() {
                    news_queries.insert(symbol.to_uppercase(), query.to_string());
                }
            }
        }

        let max_calls_per_minute = setting_usize(settings, "MAX_API_CALLS_PER_MINUTE", 5, 1)? as u32;
        let backtest_days = setting_days(settings, "BACKTEST_DAYS", 365)?;
        let live_lookback_days = setting_days(settings, "LIVE_LOOKBACK_DAYS", 1)?;

        let retry_max_attempts = setting_usize(settings, "RETRY_MAX_ATTEMPTS", 3, 1)? as u32;
        let retry_base_delay = setting_f64(settings, "RETRY_BASE_DELAY_SECS", 2.0, Some(0.0), None)?;
        let retry_max_delay = setting_f64(settings, "RETRY_MAX_DELAY_SECS", 10.0, Some(0.0), None)?;
        if retry_max_delay < retry_base_delay {
            return Err(config_error(format!(
                "RETRY_MAX_DELAY_SECS ({}) must be >= RETRY_BASE_DELAY_SECS ({})",
                retry_max_delay, retry_base_delay
            )));
        }

        let buy_threshold = setting_f64(settings, "BUY_THRESHOLD", 0.55, Some(0.0), Some(1.0))?;
        let sell_threshold = setting_f64(settings, "SELL_THRESHOLD", 0.45, Some(0.0), Some(1.0))?;
        if sell_threshold >= buy_threshold {
            return Err(config_error(format!(
                "SELL_THRESHOLD ({}) must be below BUY_THRESHOLD ({})",
                sell_threshold, buy_threshold
            )));
        }
        let trade_size_ratio = setting_f64(settings, "TRADE_SIZE_RATIO", 0.10, Some(0.0), Some(1.0))?;
        if trade_size_ratio <= 0.0 {
            return Err(config_error("TRADE_SIZE_RATIO must be greater than zero"));
        }
        let initial_balance = setting_f64(settings, "INITIAL_BALANCE", 10_000.0, Some(0.0), None)?;
        if initial_balance <= 0.0 {
            return Err(config_error("INITIAL_BALANCE must be greater than zero"));
        }
        let warmup_bars = setting_usize(settings, "WARMUP_BARS", 30, 0)?;
        let backtest_sentiment =
            setting_f64(settings, "BACKTEST_SENTIMENT", 0.0, Some(-1.0), Some(1.0))?;

        Ok(Self {
            symbols,
            news_queries,
            max_calls_per_minute,
            backtest_days,
            live_lookback_days,
            database_url: optional_setting(settings, "DATABASE_URL").map(str::to_string),
            polygon_api_key: optional_setting(settings, "POLYGON_API_KEY").map(str::to_string),
            news_api_key: optional_setting(settings, "NEWS_API_KEY").map(str::to_string),
            polygon_base_url: optional_setting(settings, "POLYGON_BASE_URL")
                .map(|value| value.trim_end_matches('/').to_string())
                .unwrap_or(defaults.polygon_base_url),
            news_api_base_url: optional_setting(settings, "NEWS_API_BASE_URL")
                .map(|value| value.trim_end_matches('/').to_string())
                .unwrap_or(defaults.news_api_base_url),
            model_path: optional_setting(settings, "MODEL_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.model_path),
            retry: RetryPolicy::new(
                retry_max_attempts,
                Duration::from_secs_f64(retry_base_delay),
                Duration::from_secs_f64(retry_max_delay),
            ),
            trading: TradingRules {
                buy_threshold,
                sell_threshold,
                trade_size_ratio,
                initial_balance,
                warmup_bars,
            },
            backtest_sentiment,
        })
    }

    /// News query text for a symbol, falling back to the symbol itself.
    pub fn news_query<'a>(&'a self, symbol: &'a str) -> &'a str {
        self.news_queries
            .get(symbol)
            .map(String::as_str)
            .unwrap_or(symbol)
    }
}

fn default_news_queries() -> HashMap<String, String> {
    DEFAULT_NEWS_QUERIES
        .iter()
        .map(|(symbol, query)| (symbol.to_string(), query.to_string()))
        .collect()
}

fn parse_symbol_list(raw: &str) -> Vec<String> {
    let mut symbols: Vec<String> = Vec::new();
    for part in raw.split(|c: char| c == ',' || c.is_whitespace()) {
        let symbol = part.trim().to_uppercase();
        if !symbol.is_empty() && !symbols.contains(&symbol) {
            symbols.push(symbol);
        }
    }
    symbols
}

fn config_error<S: Into<String>>(message: S) -> EngineError {
    EngineError::Configuration(message.into())
}

fn optional_setting<'a>(settings: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    settings
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

fn setting_f64(
    settings: &HashMap<String, String>,
    key: &str,
    default: f64,
    min: Option<f64>,
    max: Option<f64>,
) -> EngineResult<f64> {
    let Some(raw) = optional_setting(settings, key) else {
        return Ok(default);
    };
    let value = raw
        .parse::<f64>()
        .map_err(|_| config_error(format!("Setting {} must be a number (value: {})", key, raw)))?;
    if !value.is_finite() {
        return Err(config_error(format!(
            "Setting {} must be finite (value: {})",
            key, raw
        )));
    }
    if let Some(min_value) = min {
        if value < min_value {
            return Err(config_error(format!(
                "Setting {} must be >= {} (value: {})",
                key, min_value, raw
            )));
        }
    }
    if let Some(max_value) = max {
        if value > max_value {
            return Err(config_error(format!(
                "Setting {} must be <= {} (value: {})",
                key, max_value, raw
            )));
        }
    }
    Ok(value)
}

fn setting_usize(
    settings: &HashMap<String, String>,
    key: &str,
    default: usize,
    min: usize,
) -> EngineResult<usize> {
    let Some(raw) = optional_setting(settings, key) else {
        return Ok(default);
    };
    let value = raw
        .parse::<f64>()
        .map_err(|_| config_error(format!("Setting {} must be a number (value: {})", key, raw)))?;
    if !value.is_finite() || value.fract() != 0.0 {
        return Err(config_error(format!(
            "Setting {} must be an integer (value: {})",
            key, raw
        )));
    }
    if value < min as f64 {
        return Err(config_error(format!(
            "Setting {} must be >= {} (value: {})",
            key, min, raw
        )));
    }
    Ok(value as usize)
}

fn setting_days(settings: &HashMap<String, String>, key: &str, default: i64) -> EngineResult<i64> {
    let days = setting_usize(settings, key, default as usize, 1)?;
    if days > MAX_HORIZON_DAYS as usize {
        return Err(config_error(format!(
            "Setting {} must be <= {} (value: {})",
            key, MAX_HORIZON_DAYS, days
        )));
    }
    Ok(days as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn empty_settings_use_reference_defaults() {
        let config = AppConfig::from_settings_map(&HashMap::new()).unwrap();
        assert_eq!(config.symbols, vec!["SPY", "AAPL", "MSFT", "GOOGL", "AMZN"]);
        assert_eq!(config.max_calls_per_minute, 5);
        assert_eq!(config.backtest_days, 365);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base_delay, Duration::from_secs(2));
        assert_eq!(config.retry.max_delay, Duration::from_secs(10));
        assert!((config.trading.buy_threshold - 0.55).abs() < 1e-12);
        assert!((config.trading.sell_threshold - 0.45).abs() < 1e-12);
        assert!((config.trading.trade_size_ratio - 0.10).abs() < 1e-12);
        assert_eq!(config.news_query("AAPL"), "Apple OR AAPL");
        assert_eq!(config.news_query("TSLA"), "TSLA");
    }

    #[test]
    fn parses_symbols_and_news_queries() {
        let config = AppConfig::from_settings_map(&settings(&[
            ("SYMBOLS", "tsla, nvda tsla"),
            ("NEWS_QUERY_TSLA", "Tesla OR TSLA"),
            ("MAX_API_CALLS_PER_MINUTE", "2"),
        ]))
        .unwrap();
        assert_eq!(config.symbols, vec!["TSLA", "NVDA"]);
        assert_eq!(config.news_query("TSLA"), "Tesla OR TSLA");
        assert_eq!(config.news_query("NVDA"), "NVDA");
        assert_eq!(config.max_calls_per_minute, 2);
    }

    #[test]
    fn rejects_zero_rate_ceiling() {
        let err = AppConfig::from_settings_map(&settings(&[("MAX_API_CALLS_PER_MINUTE", "0")]))
            .unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let err = AppConfig::from_settings_map(&settings(&[
            ("BUY_THRESHOLD", "0.4"),
            ("SELL_THRESHOLD", "0.6"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("SELL_THRESHOLD"));
    }

    #[test]
    fn rejects_backoff_cap_below_floor() {
        let err = AppConfig::from_settings_map(&settings(&[
            ("RETRY_BASE_DELAY_SECS", "5"),
            ("RETRY_MAX_DELAY_SECS", "1"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("RETRY_MAX_DELAY_SECS"));
    }

    #[test]
    fn rejects_horizons_beyond_limit() {
        let err = AppConfig::from_settings_map(&settings(&[("BACKTEST_DAYS", "100000000")]))
            .unwrap_err();
        assert!(err.to_string().contains("BACKTEST_DAYS"));
        let err = AppConfig::from_settings_map(&settings(&[("LIVE_LOOKBACK_DAYS", "36501")]))
            .unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
        let config =
            AppConfig::from_settings_map(&settings(&[("BACKTEST_DAYS", "36500")])).unwrap();
        assert_eq!(config.backtest_days, MAX_HORIZON_DAYS);
    }
}
