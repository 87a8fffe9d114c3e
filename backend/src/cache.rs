//! Last-Good-Price Cache
//!
//! The oracle writes every validated quote here so the last known good price
//! survives restarts. Reads and writes are best-effort: callers log failures
//! and move on.
//!
//! # Cache Strategy
//! - Key: "price:BTC/USD"
//! - Value: JSON-serialized `PriceQuote`
//! - TTL: configurable, 5 minutes by default

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::Result;
use crate::types::PriceQuote;

/// Default cache TTL (Time To Live) in seconds
pub const DEFAULT_CACHE_TTL: u64 = 300;

const CACHE_KEY: &str = "price:BTC/USD";

/// Storage contract for the last good BTC/USD quote
#[async_trait]
pub trait PriceCache: Send + Sync {
    /// Read the last stored quote
    ///
    /// # Returns
    /// - `Ok(Some(quote))` if a quote is stored and has not expired
    /// - `Ok(None)` on a miss
    /// - `Err` if the backend is unreachable or holds unreadable data
    ///
    /// The oracle re-validates whatever comes back before serving it.
    async fn get(&self) -> Result<Option<PriceQuote>>;

    /// Store `quote`, replacing any previous one
    ///
    /// # How it works
    /// 1. Serialize the quote
    /// 2. Overwrite the single cache entry
    /// 3. Let the backend expire it after its TTL, if it has one
    async fn set(&self, quote: &PriceQuote) -> Result<()>;

    /// Drop the stored quote. Clearing an empty cache succeeds.
    async fn clear(&self) -> Result<()>;

    /// Is the backend reachable?
    async fn health_check(&self) -> bool;
}

/// Redis-backed cache
pub struct RedisPriceCache {
    /// Redis connection manager (handles reconnection automatically)
    connection: ConnectionManager,

    /// Cache TTL in seconds
    ttl: u64,
}

impl RedisPriceCache {
    /// Connect to Redis
    ///
    /// # Example
    /// ```rust,ignore
    /// let cache = RedisPriceCache::new("redis://127.0.0.1").await?.with_ttl(60);
    /// ```
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let connection = ConnectionManager::new(client).await?;

        debug!("Redis cache connected to {}", redis_url);

        Ok(Self {
            connection,
            ttl: DEFAULT_CACHE_TTL,
        })
    }

    /// Override the expiry applied by every `set`
    ///
    /// # Arguments
    /// * `ttl` - Seconds before a stored quote expires
    pub fn with_ttl(mut self, ttl: u64) -> Self {
        self.ttl = ttl;
        self
    }
}

#[async_trait]
impl PriceCache for RedisPriceCache {
    async fn get(&self) -> Result<Option<PriceQuote>> {
        let mut connection = self.connection.clone();
        let cached: Option<String> = connection.get(CACHE_KEY).await?;

        match cached {
            Some(json) => {
                debug!("Cache HIT for {}", CACHE_KEY);
                Ok(Some(serde_json::from_str(&json)?))
            }
            None => {
                debug!("Cache MISS for {}", CACHE_KEY);
                Ok(None)
            }
        }
    }

    async fn set(&self, quote: &PriceQuote) -> Result<()> {
        let json = serde_json::to_string(quote)?;
        let mut connection = self.connection.clone();

        redis::cmd("SET")
            .arg(CACHE_KEY)
            .arg(json)
            .arg("EX")
            .arg(self.ttl)
            .query_async::<_, ()>(&mut connection)
            .await?;

        debug!("Cached BTC price ${} (TTL: {}s)", quote.price, self.ttl);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let mut connection = self.connection.clone();
        connection.del::<_, ()>(CACHE_KEY).await?;

        debug!("Deleted cache for {}", CACHE_KEY);
        Ok(())
    }

    /// Check if Redis answers PING
    async fn health_check(&self) -> bool {
        let mut connection = self.connection.clone();
        matches!(
            redis::cmd("PING").query_async::<_, String>(&mut connection).await,
            Ok(response) if response == "PONG"
        )
    }
}

/// Process-local cache for tests and Redis-less deployments
#[derive(Debug, Default)]
pub struct MemoryPriceCache {
    quote: RwLock<Option<PriceQuote>>,
}

impl MemoryPriceCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PriceCache for MemoryPriceCache {
    async fn get(&self) -> Result<Option<PriceQuote>> {
        Ok(self.quote.read().await.clone())
    }

    async fn set(&self, quote: &PriceQuote) -> Result<()> {
        *self.quote.write().await = Some(quote.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        *self.quote.write().await = None;
        Ok(())
    }

    async fn health_check(&self) -> bool {
        true
    }
}
