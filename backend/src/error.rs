use std::time::Duration;
use thiserror::Error;

use crate::types::SourceId;

/// Failure of a single upstream source call
///
/// Every variant counts against the owning source's circuit breaker. None of
/// them escape `PriceOracle::get_price`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SourceError {
    #[error("request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("rate limited (HTTP 429)")]
    RateLimited,

    #[error("unavailable for legal reasons (HTTP 451)")]
    LegalRestriction,

    #[error("server error (HTTP {0})")]
    ServerError(u16),

    #[error("client error (HTTP {0})")]
    ClientError(u16),

    #[error("invalid price data: {0}")]
    InvalidData(String),
}

impl SourceError {
    /// Classify a non-success HTTP status. Returns `None` for 2xx/3xx.
    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            429 => Some(SourceError::RateLimited),
            451 => Some(SourceError::LegalRestriction),
            500..=599 => Some(SourceError::ServerError(status)),
            400..=499 => Some(SourceError::ClientError(status)),
            _ => None,
        }
    }

    /// HTTP status behind this failure, if there was one
    pub fn status(&self) -> Option<u16> {
        match self {
            SourceError::RateLimited => Some(429),
            SourceError::LegalRestriction => Some(451),
            SourceError::ServerError(status) | SourceError::ClientError(status) => Some(*status),
            _ => None,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, SourceError::RateLimited)
    }
}

/// Startup and boundary errors
#[derive(Error, Debug)]
pub enum OracleError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown price source: {0}")]
    UnknownSource(String),

    #[error("Price source not configured: {0}")]
    SourceNotConfigured(SourceId),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, OracleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(SourceError::from_status(429), Some(SourceError::RateLimited));
        assert_eq!(SourceError::from_status(451), Some(SourceError::LegalRestriction));
        assert_eq!(SourceError::from_status(503), Some(SourceError::ServerError(503)));
        assert_eq!(SourceError::from_status(404), Some(SourceError::ClientError(404)));
        assert_eq!(SourceError::from_status(200), None);
        assert_eq!(SourceError::from_status(304), None);
    }

    #[test]
    fn test_status_is_preserved_in_message() {
        let err = SourceError::from_status(429).unwrap();
        assert!(err.to_string().contains("429"));
        assert_eq!(err.status(), Some(429));

        let err = SourceError::ServerError(502);
        assert_eq!(err.to_string(), "server error (HTTP 502)");
        assert_eq!(err.status(), Some(502));

        let err = SourceError::Timeout(Duration::from_millis(5000));
        assert_eq!(err.to_string(), "request timed out after 5000ms");
        assert_eq!(err.status(), None);
    }
}
