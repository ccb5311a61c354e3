use crate::error::{EngineError, EngineResult};
use crate::models::{horizon_start, Bar, Prediction};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

/// Durable record keeper for bars, sentiment snapshots and predictions.
/// Every write is an upsert keyed by timestamp plus symbol or query.
#[allow(async_fn_in_trait)]
pub trait Store {
    async fn save_bar_series(&self, symbol: &str, bars: &[Bar]) -> EngineResult<()>;

    async fn save_sentiment(&self, query: &str, score: f64, raw: &Value) -> EngineResult<()>;

    async fn save_prediction(&self, prediction: &Prediction) -> EngineResult<()>;

    /// Bars for `symbol` from the last `days` days, oldest first. `None` when
    /// nothing is stored for that span.
    async fn get_history(&self, symbol: &str, days: i64) -> EngineResult<Option<Vec<Bar>>>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct SentimentRecord {
    pub query: String,
    pub timestamp: DateTime<Utc>,
    pub score: f64,
    pub raw: Value,
}

/// In-process store used by tests and dry runs.
#[derive(Default)]
pub struct MemoryStore {
    bars: Mutex<HashMap<String, BTreeMap<DateTime<Utc>, Bar>>>,
    sentiment: Mutex<Vec<SentimentRecord>>,
    predictions: Mutex<BTreeMap<(String, DateTime<Utc>), Prediction>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bar_count(&self, symbol: &str) -> usize {
        self.bars
            .lock()
            .map(|bars| bars.get(symbol).map_or(0, BTreeMap::len))
            .unwrap_or(0)
    }

    pub fn sentiment_records(&self) -> Vec<SentimentRecord> {
        self.sentiment
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }

    pub fn predictions(&self) -> Vec<Prediction> {
        self.predictions
            .lock()
            .map(|predictions| predictions.values().cloned().collect())
            .unwrap_or_default()
    }
}

fn poisoned<T>(_: T) -> EngineError {
    EngineError::Store("memory store lock poisoned".to_string())
}

impl Store for MemoryStore {
    async fn save_bar_series(&self, symbol: &str, bars: &[Bar]) -> EngineResult<()> {
        let mut stored = self.bars.lock().map_err(poisoned)?;
        let series = stored.entry(symbol.to_string()).or_default();
        for bar in bars {
            series.insert(bar.timestamp, bar.clone());
        }
        Ok(())
    }

    async fn save_sentiment(&self, query: &str, score: f64, raw: &Value) -> EngineResult<()> {
        let timestamp = Utc::now();
        let mut records = self.sentiment.lock().map_err(poisoned)?;
        records.retain(|record| !(record.query == query && record.timestamp == timestamp));
        records.push(SentimentRecord {
            query: query.to_string(),
            timestamp,
            score,
            raw: raw.clone(),
        });
        Ok(())
    }

    async fn save_prediction(&self, prediction: &Prediction) -> EngineResult<()> {
        let mut predictions = self.predictions.lock().map_err(poisoned)?;
        predictions.insert(
            (prediction.symbol.clone(), prediction.timestamp),
            prediction.clone(),
        );
        Ok(())
    }

    async fn get_history(&self, symbol: &str, days: i64) -> EngineResult<Option<Vec<Bar>>> {
        let cutoff = horizon_start(Utc::now(), days)?;
        let stored = self.bars.lock().map_err(poisoned)?;
        let bars: Vec<Bar> = stored
            .get(symbol)
            .map(|series| series.range(cutoff..).map(|(_, bar)| bar.clone()).collect())
            .unwrap_or_default();
        Ok((!bars.is_empty()).then_some(bars))
    }
}
