use crate::config::TradingRules;
use crate::error::{EngineError, EngineResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BarSize {
    Minute,
    Hour,
    Day,
}

impl BarSize {
    pub fn as_str(&self) -> &'static str {
        match self {
            BarSize::Minute => "minute",
            BarSize::Hour => "hour",
            BarSize::Day => "day",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BarRequest {
    pub symbol: String,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub bar_size: BarSize,
}

impl BarRequest {
    /// Bars for `symbol` covering the last `days` days up to `now`.
    pub fn trailing(
        symbol: &str,
        days: i64,
        bar_size: BarSize,
        now: DateTime<Utc>,
    ) -> EngineResult<Self> {
        Ok(Self {
            symbol: symbol.to_string(),
            from: horizon_start(now, days)?,
            to: now,
            bar_size,
        })
    }
}

/// Start of a `days`-long horizon ending at `now`. Horizons that leave the
/// representable date range are a configuration error.
pub fn horizon_start(now: DateTime<Utc>, days: i64) -> EngineResult<DateTime<Utc>> {
    chrono::Duration::try_days(days)
        .and_then(|span| now.checked_sub_signed(span))
        .ok_or_else(|| {
            EngineError::Configuration(format!("horizon of {} days is out of range", days))
        })
}

/// Indicator values for one bar. Warm-up positions hold 0.0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSet {
    pub ma_50: f64,
    pub ma_200: f64,
    pub rsi: f64,
    pub macd: f64,
    pub macd_signal: f64,
    pub upper_band: f64,
    pub middle_band: f64,
    pub lower_band: f64,
    pub atr: f64,
    /// Exponentially smoothed close (span 10), the "Kalman_Filter" feature.
    pub kalman_filter: f64,
    pub fib_0618: f64,
    pub cycle_strength: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedBar {
    pub bar: Bar,
    pub indicators: IndicatorSet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeAction {
    Buy,
    Sell,
    Hold,
}

impl TradeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeAction::Buy => "BUY",
            TradeAction::Sell => "SELL",
            TradeAction::Hold => "HOLD",
        }
    }

    pub fn from_prediction(prediction: f64, rules: &TradingRules) -> Self {
        if prediction > rules.buy_threshold {
            TradeAction::Buy
        } else if prediction < rules.sell_threshold {
            TradeAction::Sell
        } else {
            TradeAction::Hold
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub trend: String,
    pub momentum: String,
    pub volatility: String,
    pub fibonacci: String,
    pub cycles: String,
    pub rsi: String,
    pub atr: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub id: Uuid,
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub action: TradeAction,
    /// Distance of the blended signal from 0.5, scaled to [0, 100].
    pub confidence: f64,
    pub price: f64,
    pub sentiment_score: f64,
    pub signal: f64,
    pub indicators: IndicatorSnapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewsArticle {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl NewsArticle {
    pub fn text(&self) -> String {
        format!(
            "{}. {}",
            self.title,
            self.description.as_deref().unwrap_or_default()
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub timestamp: DateTime<Utc>,
    pub action: TradeAction,
    pub price: f64,
    pub shares: f64,
    /// Cash balance immediately after the trade.
    pub balance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestMetrics {
    pub returns: Vec<f64>,
    pub sharpe_ratio: Option<f64>,
    pub max_drawdown: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentReport {
    pub initial_balance: f64,
    pub balance: f64,
    pub position: f64,
    pub trades: Vec<Trade>,
    pub metrics: Option<BacktestMetrics>,
    pub skipped_bars: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InstrumentResult {
    Completed(InstrumentReport),
    Failed { error: String },
}

impl InstrumentResult {
    pub fn failed<S: Into<String>>(error: S) -> Self {
        InstrumentResult::Failed {
            error: error.into(),
        }
    }

    pub fn report(&self) -> Option<&InstrumentReport> {
        match self {
            InstrumentResult::Completed(report) => Some(report),
            InstrumentResult::Failed { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            InstrumentResult::Completed(_) => None,
            InstrumentResult::Failed { error } => Some(error),
        }
    }
}

/// Outcome of one instrument within a live decision cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleOutcome {
    pub symbol: String,
    pub prediction: Option<Prediction>,
    pub error: Option<String>,
}
