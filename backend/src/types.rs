use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::circuit_breaker::CircuitBreakerMetrics;
use crate::error::OracleError;

/// Price source identifier
///
/// `CoinGecko` and `Binance` are upstream providers. `Cached` and `Default`
/// are synthetic sources used only when every provider has failed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SourceId {
    CoinGecko,
    Binance,
    Cached,
    Default,
}

impl SourceId {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceId::CoinGecko => "coingecko",
            SourceId::Binance => "binance",
            SourceId::Cached => "cached",
            SourceId::Default => "default",
        }
    }

    /// True for sources backed by a real network provider.
    pub fn is_upstream(&self) -> bool {
        matches!(self, SourceId::CoinGecko | SourceId::Binance)
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceId {
    type Err = OracleError;

    /// Parses an upstream provider name. The synthetic `cached` and `default`
    /// sources are never accepted from outside.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "coingecko" => Ok(SourceId::CoinGecko),
            "binance" => Ok(SourceId::Binance),
            other => Err(OracleError::UnknownSource(other.to_string())),
        }
    }
}

/// Coarse trust label derived from how far down the fallback chain a price came from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

/// Unvalidated price as parsed from a provider response
#[derive(Debug, Clone, PartialEq)]
pub struct RawQuote {
    pub source: SourceId,

    /// `None` when the field was missing, null or not a number
    pub price: Option<f64>,
}

/// BTC/USD price returned by the oracle
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PriceQuote {
    /// Price in USD, always finite and positive
    pub price: f64,

    pub source: SourceId,

    pub confidence: Confidence,

    /// True whenever `source` is not the first configured source
    pub fallback_used: bool,

    /// One entry per source that was skipped or failed during this request
    #[serde(default)]
    pub errors: Vec<String>,

    /// Breaker snapshot taken when the quote was produced
    #[serde(default)]
    pub circuit_breaker_metrics: BTreeMap<SourceId, CircuitBreakerMetrics>,

    pub timestamp: DateTime<Utc>,
}
