use crate::error::{EngineError, EngineResult};
use crate::models::{Bar, BarRequest, NewsArticle};
use chrono::{DateTime, Utc};
use log::debug;
use reqwest::{Client, StatusCode};
use serde::de::{self, DeserializeOwned, Deserializer, Visitor};
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const AGGREGATES_LIMIT: &str = "50000";

/// Source of OHLCV bars. An empty vector means "no data", not a failure.
#[allow(async_fn_in_trait)]
pub trait MarketDataProvider {
    async fn fetch_bars(&self, request: &BarRequest) -> EngineResult<Vec<Bar>>;
}

impl<P: MarketDataProvider> MarketDataProvider for Arc<P> {
    async fn fetch_bars(&self, request: &BarRequest) -> EngineResult<Vec<Bar>> {
        self.as_ref().fetch_bars(request).await
    }
}

/// Source of recent news articles for a free-text query, newest first.
/// Also returns the raw payload so it can be archived with the score.
#[allow(async_fn_in_trait)]
pub trait NewsProvider {
    async fn fetch_articles(&self, query: &str) -> EngineResult<(Vec<NewsArticle>, Value)>;
}

pub fn build_http_client() -> EngineResult<Client> {
    Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|err| EngineError::Configuration(format!("failed to build HTTP client: {}", err)))
}

pub struct PolygonClient {
    http: Client,
    base_url: String,
    api_key: String,
}

impl PolygonClient {
    pub fn new(http: Client, base_url: &str, api_key: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }
}

impl MarketDataProvider for PolygonClient {
    async fn fetch_bars(&self, request: &BarRequest) -> EngineResult<Vec<Bar>> {
        let path = format!(
            "/v2/aggs/ticker/{}/range/1/{}/{}/{}",
            request.symbol,
            request.bar_size.as_str(),
            request.from.format("%Y-%m-%d"),
            request.to.format("%Y-%m-%d")
        );
        let response: AggregatesResponse = get_json(
            &self.http,
            &format!("{}{}", self.base_url, path),
            &[
                ("adjusted", "true"),
                ("sort", "asc"),
                ("limit", AGGREGATES_LIMIT),
                ("apiKey", self.api_key.as_str()),
            ],
        )
        .await?;

        let mut bars: Vec<Bar> = response
            .results
            .unwrap_or_default()
            .into_iter()
            .filter_map(PolygonAggregate::into_bar)
            .filter(|bar| bar.timestamp >= request.from && bar.timestamp <= request.to)
            .collect();
        bars.sort_by_key(|bar| bar.timestamp);
        bars.dedup_by_key(|bar| bar.timestamp);
        debug!("Polygon returned {} bars for {}", bars.len(), request.symbol);
        Ok(bars)
    }
}

pub struct NewsApiClient {
    http: Client,
    base_url: String,
    api_key: String,
}

impl NewsApiClient {
    pub fn new(http: Client, base_url: &str, api_key: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }
}

impl NewsProvider for NewsApiClient {
    async fn fetch_articles(&self, query: &str) -> EngineResult<(Vec<NewsArticle>, Value)> {
        let raw: Value = get_json(
            &self.http,
            &format!("{}/v2/everything", self.base_url),
            &[
                ("q", query),
                ("apiKey", self.api_key.as_str()),
                ("language", "en"),
                ("sortBy", "publishedAt"),
            ],
        )
        .await?;
        let articles = parse_articles(&raw)?;
        Ok((articles, raw))
    }
}

fn parse_articles(raw: &Value) -> EngineResult<Vec<NewsArticle>> {
    let response: NewsResponse = serde_json::from_value(raw.clone())
        .map_err(|err| EngineError::Permanent(format!("failed to parse news response: {}", err)))?;
    Ok(response
        .articles
        .unwrap_or_default()
        .into_iter()
        .filter_map(|article| {
            let title = article.title?.trim().to_string();
            (!title.is_empty()).then(|| NewsArticle {
                title,
                description: article.description,
            })
        })
        .collect())
}

async fn get_json<T: DeserializeOwned>(
    http: &Client,
    url: &str,
    query: &[(&str, &str)],
) -> EngineResult<T> {
    let response = http.get(url).query(query).send().await.map_err(|err| {
        if err.is_builder() {
            EngineError::Permanent(format!("invalid request for {}: {}", redact_url(url), err))
        } else {
            EngineError::Transient(format!("GET {} failed: {}", redact_url(url), err))
        }
    })?;

    if let Some(err) = classify_status(response.status(), url) {
        return Err(err);
    }

    response
        .json::<T>()
        .await
        .map_err(|err| EngineError::Permanent(format!("failed to decode {}: {}", redact_url(url), err)))
}

/// Maps a non-success status to the retry taxonomy.
fn classify_status(status: StatusCode, url: &str) -> Option<EngineError> {
    if status.is_success() {
        return None;
    }
    let message = format!("GET {} returned {}", redact_url(url), status);
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Some(EngineError::Transient(message))
    } else {
        Some(EngineError::Permanent(message))
    }
}

fn redact_url(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}

#[derive(Debug, Deserialize)]
struct AggregatesResponse {
    #[serde(default)]
    results: Option<Vec<PolygonAggregate>>,
}

#[derive(Debug, Deserialize)]
struct PolygonAggregate {
    /// Window start in Unix milliseconds.
    t: i64,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    o: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    h: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    l: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    c: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    v: Option<f64>,
}

impl PolygonAggregate {
    fn into_bar(self) -> Option<Bar> {
        Some(Bar {
            timestamp: DateTime::<Utc>::from_timestamp_millis(self.t)?,
            open: self.o?,
            high: self.h?,
            low: self.l?,
            close: self.c?,
            volume: self.v.unwrap_or(0.0),
        })
    }
}

#[derive(Debug, Deserialize)]
struct NewsResponse {
    #[serde(default)]
    articles: Option<Vec<RawArticle>>,
}

#[derive(Debug, Deserialize)]
struct RawArticle {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

fn deserialize_f64_opt<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    struct F64OptVisitor;

    impl<'de> Visitor<'de> for F64OptVisitor {
        type Value = Option<f64>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a number or string")
        }

        fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_f64<E: de::Error>(self, value: f64) -> Result<Self::Value, E> {
            Ok(Some(value))
        }

        fn visit_i64<E: de::Error>(self, value: i64) -> Result<Self::Value, E> {
            Ok(Some(value as f64))
        }

        fn visit_u64<E: de::Error>(self, value: u64) -> Result<Self::Value, E> {
            Ok(Some(value as f64))
        }

        fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
            Ok(value.trim().parse::<f64>().ok())
        }
    }

    deserializer.deserialize_any(F64OptVisitor)
}
