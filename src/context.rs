use crate::backtester::BacktestEngine;
use crate::config::AppConfig;
use crate::cycle::DecisionCycle;
use crate::database::PostgresStore;
use crate::fetcher::{RateLimitedFetcher, SentimentService};
use crate::prediction::{LexiconSentimentScorer, LinearScorer};
use crate::providers::{build_http_client, NewsApiClient, PolygonClient};
use crate::rate_limiter::RateLimiter;
use anyhow::{anyhow, Context, Result};
use log::{info, warn};
use std::sync::Arc;

pub type LiveDecisionCycle =
    DecisionCycle<PolygonClient, NewsApiClient, LexiconSentimentScorer, PostgresStore, LinearScorer>;

/// Wires the immutable configuration into concrete components.
#[derive(Clone)]
pub struct AppContext {
    config: Arc<AppConfig>,
}

impl AppContext {
    pub fn initialize(config: AppConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub async fn store(&self) -> Result<Arc<PostgresStore>> {
        let Some(database_url) = self.config.database_url.as_deref() else {
            return Err(anyhow!(
                "DATABASE_URL must be set to use database-backed engine commands."
            ));
        };
        let store = PostgresStore::connect(database_url).await?;
        store
            .ensure_schema()
            .await
            .context("failed to prepare store schema")?;
        Ok(Arc::new(store))
    }

    pub fn load_scorer(&self) -> Result<LinearScorer> {
        let scorer = LinearScorer::load(&self.config.model_path)?;
        info!("Loaded scoring model from {}", self.config.model_path.display());
        Ok(scorer)
    }

    pub async fn backtest_engine(&self) -> Result<BacktestEngine<PostgresStore, LinearScorer>> {
        let scorer = self.load_scorer()?;
        let store = self.store().await?;
        Ok(BacktestEngine::new(
            store,
            scorer,
            self.config.trading.clone(),
            self.config.backtest_sentiment,
        ))
    }

    pub async fn decision_cycle(&self) -> Result<LiveDecisionCycle> {
        let polygon_api_key = self
            .config
            .polygon_api_key
            .as_deref()
            .ok_or_else(|| anyhow!("POLYGON_API_KEY must be set to fetch live market data."))?;
        let store = self.store().await?;
        let http = build_http_client()?;
        let limiter = Arc::new(RateLimiter::new(self.config.max_calls_per_minute)?);

        let fetcher = RateLimitedFetcher::new(
            PolygonClient::new(http.clone(), &self.config.polygon_base_url, polygon_api_key),
            store.clone(),
            limiter.clone(),
            self.config.retry.clone(),
        );

        let sentiment = match self.config.news_api_key.as_deref() {
            Some(news_api_key) => Some(SentimentService::new(
                NewsApiClient::new(http, &self.config.news_api_base_url, news_api_key),
                LexiconSentimentScorer,
                store.clone(),
                limiter,
                self.config.retry.clone(),
            )),
            None => {
                warn!("NEWS_API_KEY not set; news sentiment is treated as neutral");
                None
            }
        };

        let scorer = self.load_scorer().map_err(|err| format!("{:#}", err));
        Ok(DecisionCycle::new(
            self.config.clone(),
            fetcher,
            sentiment,
            scorer,
            store,
        ))
    }
}
