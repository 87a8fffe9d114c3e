use anyhow::Context;
use serde::Serialize;
use std::str::FromStr;
use std::time::Duration;

use crate::binance_client::DEFAULT_BINANCE_URL;
use crate::circuit_breaker::BreakerConfig;
use crate::coingecko_client::DEFAULT_COINGECKO_URL;
use crate::error::{OracleError, Result};
use crate::types::SourceId;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host
    pub server_host: String,

    /// Server port
    pub server_port: u16,

    /// Redis connection string; an in-memory cache is used when unset
    pub redis_url: Option<String>,

    /// Lifetime of the last-good-price entry in Redis
    pub cache_ttl_seconds: u64,

    pub coingecko_base_url: String,

    pub binance_base_url: String,

    /// Oracle settings
    pub oracle_config: OracleConfig,
}

/// Static oracle tuning, loaded once at startup
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OracleConfig {
    /// Consecutive failures before a source's circuit opens
    pub failure_threshold: u32,

    /// How long an open circuit blocks calls (milliseconds)
    pub cooldown_ms: u64,

    /// Upper bound on a single upstream call (milliseconds)
    pub per_call_timeout_ms: u64,

    /// Fallback chain, primary first
    pub sources: Vec<SourceId>,

    /// Price served when every source has failed
    pub default_price: f64,

    /// Serve the cached last-good price before the static default
    pub stale_fallback: bool,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown_ms: 30_000,
            per_call_timeout_ms: 5_000,
            sources: vec![SourceId::CoinGecko, SourceId::Binance],
            default_price: 50_000.0,
            stale_fallback: false,
        }
    }
}

impl OracleConfig {
    pub fn breaker(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.failure_threshold,
            cooldown: Duration::from_millis(self.cooldown_ms),
        }
    }

    pub fn per_call_timeout(&self) -> Duration {
        Duration::from_millis(self.per_call_timeout_ms)
    }

    /// Reject configurations the oracle cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.sources.is_empty() {
            return Err(OracleError::Config("at least one price source is required".into()));
        }

        for (i, source) in self.sources.iter().enumerate() {
            if !source.is_upstream() {
                return Err(OracleError::Config(format!(
                    "{source} is not an upstream price source"
                )));
            }
            if self.sources[..i].contains(source) {
                return Err(OracleError::Config(format!("duplicate price source: {source}")));
            }
        }

        if self.failure_threshold == 0 {
            return Err(OracleError::Config("failure threshold must be at least 1".into()));
        }
        if self.cooldown_ms == 0 {
            return Err(OracleError::Config("cooldown must be positive".into()));
        }
        if self.per_call_timeout_ms == 0 {
            return Err(OracleError::Config("per-call timeout must be positive".into()));
        }
        // A call admitted before the circuit opened must settle before the
        // cooldown can hand out a recovery trial
        if self.per_call_timeout_ms >= self.cooldown_ms {
            return Err(OracleError::Config(format!(
                "per-call timeout ({}ms) must be shorter than the cooldown ({}ms)",
                self.per_call_timeout_ms, self.cooldown_ms
            )));
        }
        if !self.default_price.is_finite() || self.default_price <= 0.0 {
            return Err(OracleError::Config(format!(
                "default price must be a positive number, got {}",
                self.default_price
            )));
        }

        Ok(())
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from any key/value lookup
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = OracleConfig::default();

        let sources = match lookup("ORACLE_SOURCES") {
            Some(list) => parse_sources(&list)?,
            None => defaults.sources.clone(),
        };

        let oracle_config = OracleConfig {
            failure_threshold: parse_or(&lookup, "ORACLE_FAILURE_THRESHOLD", defaults.failure_threshold)?,
            cooldown_ms: parse_or(&lookup, "ORACLE_COOLDOWN_MS", defaults.cooldown_ms)?,
            per_call_timeout_ms: parse_or(&lookup, "ORACLE_CALL_TIMEOUT_MS", defaults.per_call_timeout_ms)?,
            sources,
            default_price: parse_or(&lookup, "ORACLE_DEFAULT_PRICE", defaults.default_price)?,
            stale_fallback: parse_or(&lookup, "ORACLE_STALE_FALLBACK", defaults.stale_fallback)?,
        };
        oracle_config.validate()?;

        Ok(Config {
            server_host: lookup("SERVER_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            server_port: parse_or(&lookup, "SERVER_PORT", 8080)?,
            redis_url: lookup("REDIS_URL").filter(|url| !url.trim().is_empty()),
            cache_ttl_seconds: parse_or(&lookup, "CACHE_TTL_SECONDS", 300)?,
            coingecko_base_url: lookup("COINGECKO_BASE_URL")
                .unwrap_or_else(|| DEFAULT_COINGECKO_URL.to_string()),
            binance_base_url: lookup("BINANCE_BASE_URL")
                .unwrap_or_else(|| DEFAULT_BINANCE_URL.to_string()),
            oracle_config,
        })
    }
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {key}: {raw:?}")),
        None => Ok(default),
    }
}

fn parse_sources(list: &str) -> anyhow::Result<Vec<SourceId>> {
    list.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(|name| name.parse::<SourceId>().map_err(anyhow::Error::from))
        .collect()
}
