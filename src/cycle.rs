use crate::config::AppConfig;
use crate::error::{EngineError, EngineResult};
use crate::fetcher::{RateLimitedFetcher, SentimentService};
use crate::indicators::compute_indicator_set;
use crate::models::{BarRequest, BarSize, CycleOutcome, Prediction};
use crate::prediction::{build_prediction, log_prediction, predict, Scorer, SentimentScorer};
use crate::providers::{MarketDataProvider, NewsProvider};
use crate::retry::CancelSignal;
use crate::store::Store;
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// One pass over every configured instrument: fetch, enrich, score, persist.
/// An external timer decides when to call `run_decision_cycle`.
pub struct DecisionCycle<P, N, T, S, M> {
    config: Arc<AppConfig>,
    fetcher: RateLimitedFetcher<P, S>,
    sentiment: Option<SentimentService<N, T, S>>,
    scorer: Result<M, String>,
    store: Arc<S>,
    model_reported: AtomicBool,
}

impl<P, N, T, S, M> DecisionCycle<P, N, T, S, M>
where
    P: MarketDataProvider,
    N: NewsProvider,
    T: SentimentScorer,
    S: Store,
    M: Scorer,
{
    pub fn new(
        config: Arc<AppConfig>,
        fetcher: RateLimitedFetcher<P, S>,
        sentiment: Option<SentimentService<N, T, S>>,
        scorer: Result<M, String>,
        store: Arc<S>,
    ) -> Self {
        Self {
            config,
            fetcher,
            sentiment,
            scorer,
            store,
            model_reported: AtomicBool::new(false),
        }
    }

    /// Processes instruments one after another. Per-instrument failures are
    /// returned as error entries; store, configuration and cancellation
    /// errors end the cycle.
    pub async fn run_decision_cycle(
        &self,
        cancel: Option<&CancelSignal>,
    ) -> EngineResult<Vec<CycleOutcome>> {
        let now = Utc::now();
        if let Err(reason) = &self.scorer {
            if !self.model_reported.swap(true, Ordering::SeqCst) {
                error!("Scoring model unavailable, predictions disabled: {}", reason);
            }
        }

        let mut outcomes = Vec::with_capacity(self.config.symbols.len());
        for symbol in &self.config.symbols {
            if cancel.is_some_and(CancelSignal::is_cancelled) {
                warn!("Decision cycle cancelled before {}", symbol);
                return Err(EngineError::Cancelled);
            }

            match self.process_instrument(symbol, now, cancel).await {
                Ok(prediction) => outcomes.push(CycleOutcome {
                    symbol: symbol.clone(),
                    prediction: Some(prediction),
                    error: None,
                }),
                Err(err) if err.is_fatal() => {
                    error!("Decision cycle aborted at {}: {}", symbol, err);
                    return Err(err);
                }
                Err(err) => {
                    if !matches!(err, EngineError::ModelUnavailable(_)) {
                        error!("Error processing {}: {}", symbol, err);
                    }
                    outcomes.push(CycleOutcome {
                        symbol: symbol.clone(),
                        prediction: None,
                        error: Some(err.to_string()),
                    });
                }
            }
        }

        let completed = outcomes.iter().filter(|o| o.prediction.is_some()).count();
        info!(
            "Decision cycle finished: {}/{} instruments produced a recommendation",
            completed,
            outcomes.len()
        );
        Ok(outcomes)
    }

    async fn process_instrument(
        &self,
        symbol: &str,
        now: DateTime<Utc>,
        cancel: Option<&CancelSignal>,
    ) -> EngineResult<Prediction> {
        let scorer = self
            .scorer
            .as_ref()
            .map_err(|reason| EngineError::ModelUnavailable(reason.clone()))?;

        let request =
            BarRequest::trailing(symbol, self.config.live_lookback_days, BarSize::Minute, now)?;
        let bars = self.fetcher.fetch_bars(&request, cancel).await?;
        let enriched = compute_indicator_set(&bars)?;
        let latest = enriched
            .last()
            .ok_or_else(|| EngineError::NoDataAvailable(symbol.to_string()))?;

        let sentiment = match &self.sentiment {
            Some(service) => {
                service
                    .sentiment_for(symbol, self.config.news_query(symbol), now.date_naive(), cancel)
                    .await?
            }
            None => 0.0,
        };

        let signal = predict(&enriched, sentiment, scorer)?;
        let prediction =
            build_prediction(symbol, latest, signal, sentiment, &self.config.trading, now);
        self.store.save_prediction(&prediction).await?;
        log_prediction(&prediction);
        Ok(prediction)
    }
}
