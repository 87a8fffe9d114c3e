//! Bitcoin price oracle
//!
//! Serves a BTC/USD price on every request by walking an ordered chain of
//! upstream providers, each guarded by its own circuit breaker, and falling
//! back to a static default when all of them fail.

pub mod api;
pub mod binance_client;
pub mod cache;
pub mod circuit_breaker;
pub mod clock;
pub mod coingecko_client;
pub mod config;
pub mod error;
pub mod http_client;
pub mod metrics;
pub mod oracle;
pub mod source;
pub mod types;
pub mod validation;

pub use error::{OracleError, Result, SourceError};
pub use oracle::PriceOracle;
pub use types::{Confidence, PriceQuote, SourceId};
