use crate::config::TradingRules;
use crate::error::{EngineError, EngineResult};
use crate::models::{EnrichedBar, IndicatorSnapshot, Prediction, TradeAction};
use chrono::{DateTime, Utc};
use log::info;
use serde::Deserialize;
use std::path::Path;
use uuid::Uuid;

pub const SEQUENCE_LENGTH: usize = 30;
pub const FEATURE_COUNT: usize = 11;
pub const FEATURE_COLUMNS: [&str; FEATURE_COUNT] = [
    "open",
    "high",
    "low",
    "close",
    "volume",
    "RSI",
    "MACD",
    "ATR",
    "Kalman_Filter",
    "Fib_0.618",
    "Cycle_Strength",
];
const MODEL_BLEND: f64 = 0.7;
const SENTIMENT_BLEND: f64 = 0.3;

pub type FeatureRow = [f64; FEATURE_COUNT];

/// The most recent `SEQUENCE_LENGTH` bars, oldest first, as feature rows.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureWindow {
    rows: Vec<FeatureRow>,
}

impl FeatureWindow {
    pub fn from_enriched(bars: &[EnrichedBar]) -> EngineResult<Self> {
        if bars.len() < SEQUENCE_LENGTH {
            return Err(EngineError::InsufficientWindow {
                required: SEQUENCE_LENGTH,
                actual: bars.len(),
            });
        }
        let rows = bars[bars.len() - SEQUENCE_LENGTH..]
            .iter()
            .map(feature_row)
            .collect();
        Ok(Self { rows })
    }

    pub fn rows(&self) -> &[FeatureRow] {
        &self.rows
    }

    pub fn column_means(&self) -> FeatureRow {
        let mut means = [0.0; FEATURE_COUNT];
        for row in &self.rows {
            for (mean, value) in means.iter_mut().zip(row.iter()) {
                *mean += value;
            }
        }
        for mean in means.iter_mut() {
            *mean /= self.rows.len() as f64;
        }
        means
    }
}

fn feature_row(enriched: &EnrichedBar) -> FeatureRow {
    let bar = &enriched.bar;
    let set = &enriched.indicators;
    [
        bar.open,
        bar.high,
        bar.low,
        bar.close,
        bar.volume,
        set.rsi,
        set.macd,
        set.atr,
        set.kalman_filter,
        set.fib_0618,
        set.cycle_strength,
    ]
}

/// Opaque price-movement model: feature window in, probability-like signal out.
pub trait Scorer: Send + Sync {
    fn score(&self, window: &FeatureWindow) -> EngineResult<f64>;
}

impl<F> Scorer for F
where
    F: Fn(&FeatureWindow) -> EngineResult<f64> + Send + Sync,
{
    fn score(&self, window: &FeatureWindow) -> EngineResult<f64> {
        self(window)
    }
}

/// Opaque text sentiment model returning a score in [-1, 1].
pub trait SentimentScorer: Send + Sync {
    fn score_text(&self, text: &str) -> EngineResult<f64>;
}

impl<F> SentimentScorer for F
where
    F: Fn(&str) -> EngineResult<f64> + Send + Sync,
{
    fn score_text(&self, text: &str) -> EngineResult<f64> {
        self(text)
    }
}

/// Rescales a sentiment score from [-1, 1] to [0, 1].
pub fn sentiment_weight(sentiment_score: f64) -> f64 {
    (sentiment_score.clamp(-1.0, 1.0) + 1.0) / 2.0
}

/// Blends the model signal over the latest feature window with sentiment.
pub fn predict<S: Scorer + ?Sized>(
    bars: &[EnrichedBar],
    sentiment_score: f64,
    scorer: &S,
) -> EngineResult<f64> {
    let window = FeatureWindow::from_enriched(bars)?;
    let model_signal = scorer.score(&window)?;
    if !model_signal.is_finite() {
        return Err(EngineError::Permanent(format!(
            "scorer returned a non-finite signal ({})",
            model_signal
        )));
    }
    let blended = model_signal * MODEL_BLEND + sentiment_weight(sentiment_score) * SENTIMENT_BLEND;
    Ok(blended.clamp(0.0, 1.0))
}

/// Confidence in percent: how far the signal sits from the neutral 0.5.
pub fn confidence(signal: f64) -> f64 {
    (((signal - 0.5) * 200.0 * 10.0).round() / 10.0).abs()
}

pub fn indicator_snapshot(latest: &EnrichedBar) -> IndicatorSnapshot {
    let close = latest.bar.close;
    let set = &latest.indicators;
    IndicatorSnapshot {
        trend: if set.ma_50 > set.ma_200 { "Bullish" } else { "Bearish" }.to_string(),
        momentum: if set.macd > set.macd_signal { "Strong" } else { "Weak" }.to_string(),
        volatility: if close > set.upper_band { "High" } else { "Low" }.to_string(),
        fibonacci: if close > set.fib_0618 { "Support" } else { "Resistance" }.to_string(),
        cycles: format!("{:.2}", set.cycle_strength),
        rsi: format!("{:.1}", set.rsi),
        atr: format!("{:.2}", set.atr),
    }
}

pub fn build_prediction(
    symbol: &str,
    latest: &EnrichedBar,
    signal: f64,
    sentiment_score: f64,
    rules: &TradingRules,
    timestamp: DateTime<Utc>,
) -> Prediction {
    Prediction {
        id: Uuid::new_v4(),
        symbol: symbol.to_string(),
        timestamp,
        action: TradeAction::from_prediction(signal, rules),
        confidence: confidence(signal),
        price: latest.bar.close,
        sentiment_score: (sentiment_score * 100.0).round() / 100.0,
        signal,
        indicators: indicator_snapshot(latest),
    }
}

pub fn log_prediction(prediction: &Prediction) {
    let snapshot = &prediction.indicators;
    info!(
        "\n=== TRADING RECOMMENDATION ===\n\
         SYMBOL:            {}\n\
         TIME:              {}\n\
         PRICE:             {:.2}\n\
         ACTION:            {} (Confidence: {}%)\n\
         NEWS SENTIMENT:    {:.2}\n\
         TECHNICAL INDICATORS:\n\
         {:<15}: {}\n{:<15}: {}\n{:<15}: {}\n{:<15}: {}\n{:<15}: {}\n{:<15}: {}\n{:<15}: {}\n\
         ==================================================",
        prediction.symbol,
        prediction.timestamp.format("%Y-%m-%d %H:%M:%S"),
        prediction.price,
        prediction.action.as_str(),
        prediction.confidence,
        prediction.sentiment_score,
        "TREND",
        snapshot.trend,
        "MOMENTUM",
        snapshot.momentum,
        "VOLATILITY",
        snapshot.volatility,
        "FIBONACCI",
        snapshot.fibonacci,
        "CYCLES",
        snapshot.cycles,
        "RSI",
        snapshot.rsi,
        "ATR",
        snapshot.atr,
    );
}

const POSITIVE_TERMS: &[&str] = &[
    "beat", "beats", "bullish", "gain", "gains", "growth", "higher", "jump", "jumps", "outperform",
    "profit", "rally", "rallies", "record", "rebound", "rise", "rises", "soar", "soars", "strong",
    "surge", "surges", "upgrade", "upgraded",
];
const NEGATIVE_TERMS: &[&str] = &[
    "bearish", "crash", "cut", "cuts", "decline", "declines", "downgrade", "downgraded", "drop",
    "drops", "fall", "falls", "fear", "fears", "lawsuit", "loss", "losses", "lower", "miss",
    "misses", "plunge", "plunges", "recall", "slump", "weak",
];

/// Word-count sentiment: (positive - negative) / (positive + negative).
#[derive(Debug, Clone, Copy, Default)]
pub struct LexiconSentimentScorer;

impl SentimentScorer for LexiconSentimentScorer {
    fn score_text(&self, text: &str) -> EngineResult<f64> {
        let (mut positive, mut negative) = (0usize, 0usize);
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|word| !word.is_empty())
        {
            let word = word.to_lowercase();
            if POSITIVE_TERMS.contains(&word.as_str()) {
                positive += 1;
            } else if NEGATIVE_TERMS.contains(&word.as_str()) {
                negative += 1;
            }
        }
        let total = positive + negative;
        if total == 0 {
            return Ok(0.0);
        }
        Ok((positive as f64 - negative as f64) / total as f64)
    }
}

#[derive(Debug, Deserialize)]
struct LinearModelFile {
    weights: Vec<f64>,
    #[serde(default)]
    bias: f64,
}

/// Logistic model over the window's per-column means, loaded from a JSON
/// file of the form `{"weights": [11 numbers], "bias": 0.0}`.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearScorer {
    weights: FeatureRow,
    bias: f64,
}

impl LinearScorer {
    pub fn new(weights: FeatureRow, bias: f64) -> Self {
        Self { weights, bias }
    }

    pub fn load(path: &Path) -> EngineResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|err| {
            EngineError::ModelUnavailable(format!("cannot read {}: {}", path.display(), err))
        })?;
        Self::from_json(&text)
            .map_err(|err| EngineError::ModelUnavailable(format!("{}: {}", path.display(), err)))
    }

    pub fn from_json(text: &str) -> Result<Self, String> {
        let parsed: LinearModelFile =
            serde_json::from_str(text).map_err(|err| format!("invalid model file: {}", err))?;
        let weights: FeatureRow = parsed.weights.as_slice().try_into().map_err(|_| {
            format!(
                "expected {} weights, found {}",
                FEATURE_COUNT,
                parsed.weights.len()
            )
        })?;
        if !parsed.bias.is_finite() || weights.iter().any(|w| !w.is_finite()) {
            return Err("model parameters must be finite".to_string());
        }
        Ok(Self::new(weights, parsed.bias))
    }
}

impl Scorer for LinearScorer {
    fn score(&self, window: &FeatureWindow) -> EngineResult<f64> {
        let means = window.column_means();
        let logit = self.bias
            + self
                .weights
                .iter()
                .zip(means.iter())
                .map(|(weight, value)| weight * value)
                .sum::<f64>();
        Ok(1.0 / (1.0 + (-logit).exp()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Bar, IndicatorSet};
    use chrono::{Duration, TimeZone};

    fn enriched(n: usize) -> Vec<EnrichedBar> {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        (0..n)
            .map(|i| EnrichedBar {
                bar: Bar {
                    timestamp: start + Duration::minutes(i as i64),
                    open: 10.0 + i as f64,
                    high: 11.0 + i as f64,
                    low: 9.0 + i as f64,
                    close: 10.5 + i as f64,
                    volume: 100.0,
                },
                indicators: IndicatorSet {
                    rsi: 55.0,
                    macd: 0.2,
                    macd_signal: 0.1,
                    ma_50: 12.0,
                    ma_200: 11.0,
                    upper_band: 100.0,
                    fib_0618: 5.0,
                    cycle_strength: 3.14159,
                    atr: 1.234,
                    ..IndicatorSet::default()
                },
            })
            .collect()
    }

    #[test]
    fn window_takes_latest_thirty_rows_in_column_order() {
        let bars = enriched(45);
        let window = FeatureWindow::from_enriched(&bars).unwrap();
        assert_eq!(window.rows().len(), SEQUENCE_LENGTH);
        assert_eq!(window.rows()[0][0], 25.0);
        assert_eq!(window.rows()[29][3], 10.5 + 44.0);
        assert_eq!(window.rows()[29][5], 55.0);
        assert_eq!(window.rows()[29][10], 3.14159);
    }

    #[test]
    fn short_window_is_rejected() {
        let scorer = |_: &FeatureWindow| -> EngineResult<f64> { Ok(0.5) };
        let err = predict(&enriched(29), 0.0, &scorer).unwrap_err();
        assert!(matches!(
            err,
            EngineError::InsufficientWindow {
                required: 30,
                actual: 29
            }
        ));
    }

    #[test]
    fn blends_model_signal_with_sentiment_weight() {
        let scorer = |_: &FeatureWindow| -> EngineResult<f64> { Ok(0.8) };
        let bars = enriched(30);
        let neutral = predict(&bars, 0.0, &scorer).unwrap();
        assert!((neutral - (0.8 * 0.7 + 0.5 * 0.3)).abs() < 1e-12);
        let bullish = predict(&bars, 1.0, &scorer).unwrap();
        assert!((bullish - (0.8 * 0.7 + 0.3)).abs() < 1e-12);
        let bearish = predict(&bars, -1.0, &scorer).unwrap();
        assert!((bearish - 0.8 * 0.7).abs() < 1e-12);
    }

    #[test]
    fn scorer_failures_propagate() {
        let scorer = |_: &FeatureWindow| -> EngineResult<f64> {
            Err(EngineError::ModelUnavailable("weights missing".into()))
        };
        assert!(matches!(
            predict(&enriched(30), 0.0, &scorer),
            Err(EngineError::ModelUnavailable(_))
        ));
    }

    #[test]
    fn recommendation_reflects_signal_and_indicators() {
        let bars = enriched(30);
        let latest = bars.last().unwrap();
        let now = Utc.with_ymd_and_hms(2024, 3, 2, 15, 30, 0).unwrap();
        let prediction =
            build_prediction("AAPL", latest, 0.6234, 0.456, &TradingRules::default(), now);
        assert_eq!(prediction.action, TradeAction::Buy);
        assert!((prediction.confidence - 24.7).abs() < 1e-9);
        assert!((prediction.sentiment_score - 0.46).abs() < 1e-9);
        assert_eq!(prediction.price, latest.bar.close);
        assert_eq!(prediction.indicators.trend, "Bullish");
        assert_eq!(prediction.indicators.momentum, "Strong");
        assert_eq!(prediction.indicators.volatility, "Low");
        assert_eq!(prediction.indicators.fibonacci, "Support");
        assert_eq!(prediction.indicators.cycles, "3.14");
        assert_eq!(prediction.indicators.rsi, "55.0");
        assert_eq!(prediction.indicators.atr, "1.23");

        let hold = build_prediction("AAPL", latest, 0.5, 0.0, &TradingRules::default(), now);
        assert_eq!(hold.action, TradeAction::Hold);
        assert_eq!(hold.confidence, 0.0);
        let sell = build_prediction("AAPL", latest, 0.3, 0.0, &TradingRules::default(), now);
        assert_eq!(sell.action, TradeAction::Sell);
        assert!((sell.confidence - 40.0).abs() < 1e-9);
    }

    #[test]
    fn linear_scorer_parses_and_scores() {
        let scorer = LinearScorer::from_json(
            r#"{"weights": [0,0,0,0,0,0,0,0,0,0,0], "bias": 0.0}"#,
        )
        .unwrap();
        let window = FeatureWindow::from_enriched(&enriched(30)).unwrap();
        assert!((scorer.score(&window).unwrap() - 0.5).abs() < 1e-12);

        let err = LinearScorer::from_json(r#"{"weights": [1, 2]}"#).unwrap_err();
        assert!(err.contains("expected 11 weights"));
    }

    #[test]
    fn lexicon_scorer_balances_terms() {
        let scorer = LexiconSentimentScorer;
        assert_eq!(scorer.score_text("Shares surge to record high").unwrap(), 1.0);
        assert_eq!(scorer.score_text("Stock plunges after earnings miss").unwrap(), -1.0);
        assert_eq!(scorer.score_text("Profit rises, but fears of a recall").unwrap(), 0.0);
        assert_eq!(scorer.score_text("Company holds annual meeting").unwrap(), 0.0);
    }

    #[test]
    fn missing_model_file_is_model_unavailable() {
        let err = LinearScorer::load(Path::new("/nonexistent/model.json")).unwrap_err();
        assert!(matches!(err, EngineError::ModelUnavailable(_)));
    }
}
