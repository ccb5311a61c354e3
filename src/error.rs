use thiserror::Error;

pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Network failure, timeout, HTTP 5xx or 429. Retried with backoff.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Malformed request or response. Never retried.
    #[error("invalid request: {0}")]
    Permanent(String),

    #[error("fetch failed after {attempts} attempt(s): {source}")]
    FetchFailed {
        attempts: u32,
        #[source]
        source: Box<EngineError>,
    },

    #[error("no data available for {0}")]
    NoDataAvailable(String),

    #[error("insufficient history: need at least {required} bars, got {actual}")]
    InsufficientHistory { required: usize, actual: usize },

    #[error("insufficient feature window: need {required} bars, got {actual}")]
    InsufficientWindow { required: usize, actual: usize },

    #[error("scoring model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl EngineError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Transient(_))
    }

    /// Failures of shared infrastructure that must stop the whole run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::Store(_) | EngineError::Configuration(_) | EngineError::Cancelled
        )
    }

    pub fn store<E: std::fmt::Display>(err: E) -> Self {
        EngineError::Store(err.to_string())
    }
}

impl From<tokio_postgres::Error> for EngineError {
    fn from(err: tokio_postgres::Error) -> Self {
        EngineError::Store(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(EngineError::Transient("503".into()).is_retryable());
        assert!(!EngineError::Permanent("400".into()).is_retryable());
        assert!(!EngineError::NoDataAvailable("SPY".into()).is_retryable());
    }

    #[test]
    fn fetch_failed_keeps_last_cause() {
        let err = EngineError::FetchFailed {
            attempts: 3,
            source: Box::new(EngineError::Transient("connection reset".into())),
        };
        let message = err.to_string();
        assert!(message.contains("3 attempt"));
        assert!(message.contains("connection reset"));
        assert!(!err.is_fatal());
    }
}
