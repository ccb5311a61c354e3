use crate::error::{EngineError, EngineResult};
use crate::models::{horizon_start, Bar, Prediction};
use crate::store::Store;
use chrono::{DateTime, Utc};
use log::{error, info};
use serde_json::Value;
use tokio_postgres::{Client, NoTls, Row};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS market_data (
        symbol TEXT NOT NULL,
        timestamp TIMESTAMPTZ NOT NULL,
        open DOUBLE PRECISION NOT NULL,
        high DOUBLE PRECISION NOT NULL,
        low DOUBLE PRECISION NOT NULL,
        close DOUBLE PRECISION NOT NULL,
        volume DOUBLE PRECISION NOT NULL,
        PRIMARY KEY (symbol, timestamp)
    );
    CREATE TABLE IF NOT EXISTS news_sentiment (
        query TEXT NOT NULL,
        timestamp TIMESTAMPTZ NOT NULL,
        sentiment_score DOUBLE PRECISION NOT NULL,
        raw_data JSONB,
        PRIMARY KEY (query, timestamp)
    );
    CREATE TABLE IF NOT EXISTS predictions (
        symbol TEXT NOT NULL,
        timestamp TIMESTAMPTZ NOT NULL,
        id UUID NOT NULL,
        action TEXT NOT NULL,
        confidence DOUBLE PRECISION NOT NULL,
        price DOUBLE PRECISION NOT NULL,
        sentiment_score DOUBLE PRECISION NOT NULL,
        signal DOUBLE PRECISION NOT NULL,
        indicators JSONB NOT NULL,
        PRIMARY KEY (symbol, timestamp)
    );
";

/// `Store` backed by PostgreSQL.
pub struct PostgresStore {
    client: Client,
}

impl PostgresStore {
    pub async fn connect<S: AsRef<str>>(database_url: S) -> EngineResult<Self> {
        let database_url = database_url.as_ref();
        let (client, connection) = tokio_postgres::connect(database_url, NoTls)
            .await
            .map_err(|err| {
                EngineError::Store(format!(
                    "failed to connect to PostgreSQL at {}: {}",
                    redact_password(database_url),
                    err
                ))
            })?;

        tokio::spawn(async move {
            if let Err(err) = connection.await {
                error!("PostgreSQL connection error: {}", err);
            }
        });

        Ok(Self { client })
    }

    pub async fn ensure_schema(&self) -> EngineResult<()> {
        self.client.batch_execute(SCHEMA).await?;
        info!("Store schema ready");
        Ok(())
    }

    fn map_bar_row(row: &Row) -> Bar {
        Bar {
            timestamp: row.get(0),
            open: row.get(1),
            high: row.get(2),
            low: row.get(3),
            close: row.get(4),
            volume: row.get(5),
        }
    }
}

impl Store for PostgresStore {
    async fn save_bar_series(&self, symbol: &str, bars: &[Bar]) -> EngineResult<()> {
        if bars.is_empty() {
            return Ok(());
        }
        let stmt = self
            .client
            .prepare(
                "INSERT INTO market_data (symbol, timestamp, open, high, low, close, volume)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)
                 ON CONFLICT (symbol, timestamp) DO UPDATE
                 SET open = EXCLUDED.open,
                     high = EXCLUDED.high,
                     low = EXCLUDED.low,
                     close = EXCLUDED.close,
                     volume = EXCLUDED.volume",
            )
            .await?;
        for bar in bars {
            self.client
                .execute(
                    &stmt,
                    &[
                        &symbol,
                        &bar.timestamp,
                        &bar.open,
                        &bar.high,
                        &bar.low,
                        &bar.close,
                        &bar.volume,
                    ],
                )
                .await?;
        }
        Ok(())
    }

    async fn save_sentiment(&self, query: &str, score: f64, raw: &Value) -> EngineResult<()> {
        let timestamp = Utc::now();
        self.client
            .execute(
                "INSERT INTO news_sentiment (query, timestamp, sentiment_score, raw_data)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (query, timestamp) DO UPDATE
                 SET sentiment_score = EXCLUDED.sentiment_score,
                     raw_data = EXCLUDED.raw_data",
                &[&query, &timestamp, &score, raw],
            )
            .await?;
        Ok(())
    }

    async fn save_prediction(&self, prediction: &Prediction) -> EngineResult<()> {
        let indicators = serde_json::to_value(&prediction.indicators).map_err(EngineError::store)?;
        self.client
            .execute(
                "INSERT INTO predictions (symbol, timestamp, id, action, confidence, price, sentiment_score, signal, indicators)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                 ON CONFLICT (symbol, timestamp) DO UPDATE
                 SET id = EXCLUDED.id,
                     action = EXCLUDED.action,
                     confidence = EXCLUDED.confidence,
                     price = EXCLUDED.price,
                     sentiment_score = EXCLUDED.sentiment_score,
                     signal = EXCLUDED.signal,
                     indicators = EXCLUDED.indicators",
                &[
                    &prediction.symbol,
                    &prediction.timestamp,
                    &prediction.id,
                    &prediction.action.as_str(),
                    &prediction.confidence,
                    &prediction.price,
                    &prediction.sentiment_score,
                    &prediction.signal,
                    &indicators,
                ],
            )
            .await?;
        Ok(())
    }

    async fn get_history(&self, symbol: &str, days: i64) -> EngineResult<Option<Vec<Bar>>> {
        let cutoff: DateTime<Utc> = horizon_start(Utc::now(), days)?;
        let rows = self
            .client
            .query(
                "SELECT timestamp, open, high, low, close, volume
                 FROM market_data
                 WHERE symbol = $1 AND timestamp >= $2
                 ORDER BY timestamp",
                &[&symbol, &cutoff],
            )
            .await?;
        if rows.is_empty() {
            return Ok(None);
        }
        Ok(Some(rows.iter().map(Self::map_bar_row).collect()))
    }
}

/// Hides the password component of a connection URL for log output.
fn redact_password(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let Some((credentials, host)) = rest.split_once('@') else {
        return url.to_string();
    };
    match credentials.split_once(':') {
        Some((user, _)) => format!("{}://{}:***@{}", scheme, user, host),
        None => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_urls_are_redacted() {
        assert_eq!(
            redact_password("postgres://trader:hunter2@db:5432/signals"),
            "postgres://trader:***@db:5432/signals"
        );
        assert_eq!(
            redact_password("postgres://db:5432/signals"),
            "postgres://db:5432/signals"
        );
        assert_eq!(redact_password("host=localhost"), "host=localhost");
    }
}
