use crate::error::{EngineError, EngineResult};
use crate::models::{Bar, BarRequest};
use crate::prediction::SentimentScorer;
use crate::providers::{MarketDataProvider, NewsProvider};
use crate::rate_limiter::RateLimiter;
use crate::retry::{CancelSignal, RetryPolicy};
use crate::store::Store;
use chrono::NaiveDate;
use dashmap::DashMap;
use log::{error, info, warn};
use std::sync::Arc;

pub const MAX_SCORED_ARTICLES: usize = 5;

/// Market-bar fetcher that enforces the shared call-rate ceiling and retry
/// policy, persists every non-empty result, and falls back to stored bars
/// when the provider has nothing.
pub struct RateLimitedFetcher<P, S> {
    provider: P,
    store: Arc<S>,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    last_bars: DashMap<String, Vec<Bar>>,
}

impl<P: MarketDataProvider, S: Store> RateLimitedFetcher<P, S> {
    pub fn new(provider: P, store: Arc<S>, limiter: Arc<RateLimiter>, retry: RetryPolicy) -> Self {
        Self {
            provider,
            store,
            limiter,
            retry,
            last_bars: DashMap::new(),
        }
    }

    pub async fn fetch_bars(
        &self,
        request: &BarRequest,
        cancel: Option<&CancelSignal>,
    ) -> EngineResult<Vec<Bar>> {
        let context = format!("{} bars for {}", request.bar_size.as_str(), request.symbol);
        let bars = self
            .retry
            .run(&context, cancel, EngineError::is_retryable, |_| async move {
                self.limiter.acquire(cancel).await?;
                self.provider.fetch_bars(request).await
            })
            .await?;

        if !bars.is_empty() {
            self.store.save_bar_series(&request.symbol, &bars).await?;
            self.last_bars.insert(request.symbol.clone(), bars.clone());
            info!("Fetched {} bars for {}", bars.len(), request.symbol);
            return Ok(bars);
        }

        warn!("Empty data for {}, trying cache", request.symbol);
        if let Some(cached) = self
            .store
            .get_history(&request.symbol, lookback_days(request))
            .await?
        {
            if !cached.is_empty() {
                info!(
                    "Using {} stored bars for {} in place of the live fetch",
                    cached.len(),
                    request.symbol
                );
                return Ok(cached);
            }
        }
        if let Some(cached) = self.last_bars.get(&request.symbol) {
            info!("Using last fetched bars for {}", request.symbol);
            return Ok(cached.value().clone());
        }
        Err(EngineError::NoDataAvailable(request.symbol.clone()))
    }

    /// Most recent non-empty live result for `symbol`, if any.
    pub fn last_bars(&self, symbol: &str) -> Option<Vec<Bar>> {
        self.last_bars.get(symbol).map(|entry| entry.value().clone())
    }
}

/// Whole days spanned by the request, at least one.
fn lookback_days(request: &BarRequest) -> i64 {
    let span = request.to - request.from;
    let days = span.num_days();
    let partial = span > chrono::Duration::days(days);
    (days + i64::from(partial)).max(1)
}

/// Per-instrument news sentiment in [-1, 1], cached for the day.
pub struct SentimentService<N, T, S> {
    provider: N,
    scorer: T,
    store: Arc<S>,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    cache: DashMap<(String, NaiveDate), f64>,
}

impl<N, T, S> SentimentService<N, T, S>
where
    N: NewsProvider,
    T: SentimentScorer,
    S: Store,
{
    pub fn new(
        provider: N,
        scorer: T,
        store: Arc<S>,
        limiter: Arc<RateLimiter>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            provider,
            scorer,
            store,
            limiter,
            retry,
            cache: DashMap::new(),
        }
    }

    /// Mean score of the first articles for `query`. Fetch failures fall back
    /// to the day's cached score or 0.0; only fatal errors are returned.
    pub async fn sentiment_for(
        &self,
        symbol: &str,
        query: &str,
        day: NaiveDate,
        cancel: Option<&CancelSignal>,
    ) -> EngineResult<f64> {
        let key = (symbol.to_string(), day);
        if let Some(score) = self.cache.get(&key) {
            return Ok(*score);
        }

        match self.fetch_score(query, cancel).await {
            Ok(score) => {
                self.cache.insert(key, score);
                Ok(score)
            }
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                error!("News sentiment failed for {}, using cached value: {}", symbol, err);
                Ok(self.cached(symbol, day).unwrap_or(0.0))
            }
        }
    }

    pub fn cached(&self, symbol: &str, day: NaiveDate) -> Option<f64> {
        self.cache
            .get(&(symbol.to_string(), day))
            .map(|score| *score)
    }

    async fn fetch_score(&self, query: &str, cancel: Option<&CancelSignal>) -> EngineResult<f64> {
        let context = format!("news for '{}'", query);
        let (articles, raw) = self
            .retry
            .run(&context, cancel, EngineError::is_retryable, |_| async move {
                self.limiter.acquire(cancel).await?;
                self.provider.fetch_articles(query).await
            })
            .await?;

        let scores: Vec<f64> = articles
            .iter()
            .take(MAX_SCORED_ARTICLES)
            .map(|article| match self.scorer.score_text(&article.text()) {
                Ok(score) if score.is_finite() => score.clamp(-1.0, 1.0),
                Ok(_) => 0.0,
                Err(err) => {
                    warn!("Sentiment analysis failed: {}", err);
                    0.0
                }
            })
            .collect();
        let score = if scores.is_empty() {
            0.0
        } else {
            scores.iter().sum::<f64>() / scores.len() as f64
        };

        self.store.save_sentiment(query, score, &raw).await?;
        Ok(score)
    }
}
