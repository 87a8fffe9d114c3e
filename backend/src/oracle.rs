//! Price Oracle
//!
//! Produces a BTC/USD quote on every request, whatever state the upstream
//! providers are in.
//!
//! # Architecture
//! ```text
//! get_price() → [CoinGecko breaker] → CoinGecko → validate ─┐
//!                    │ open / failed                         │ first valid price wins
//!                    ↓                                       ↓
//!               [Binance breaker] → Binance → validate ──→ PriceQuote
//!                    │ open / failed
//!                    ↓
//!               (cached last-good price) → static default
//! ```
//!
//! Sources are walked one at a time, never raced: a skipped source costs no
//! network call and parallel calls would burn the rate limits the breakers
//! are protecting.

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::PriceCache;
use crate::clock::{Clock, SystemClock};
use crate::config::OracleConfig;
use crate::error::{OracleError, Result, SourceError};
use crate::metrics::{MetricsRegistry, ServiceMetrics};
use crate::source::PriceSource;
use crate::types::{Confidence, PriceQuote, SourceId};
use crate::validation::{validate_price, validate_quote};

pub struct PriceOracle {
    config: OracleConfig,

    /// Clients in fallback-chain order, primary first
    sources: Vec<Arc<dyn PriceSource>>,

    registry: Arc<MetricsRegistry>,

    cache: Option<Arc<dyn PriceCache>>,
}

impl PriceOracle {
    /// Create an oracle with fresh breakers driven by the system clock.
    ///
    /// `sources` must list one client per configured source, in the
    /// configured order.
    pub fn new(config: OracleConfig, sources: Vec<Arc<dyn PriceSource>>) -> Result<Self> {
        let registry = MetricsRegistry::new(&config.sources, config.breaker(), Arc::new(SystemClock));
        Self::with_registry(config, sources, Arc::new(registry))
    }

    /// Create an oracle around an existing breaker registry.
    pub fn with_registry(
        config: OracleConfig,
        sources: Vec<Arc<dyn PriceSource>>,
        registry: Arc<MetricsRegistry>,
    ) -> Result<Self> {
        config.validate()?;

        let client_order: Vec<SourceId> = sources.iter().map(|s| s.id()).collect();
        if client_order != config.sources {
            return Err(OracleError::Config(format!(
                "source clients {client_order:?} do not match configured order {:?}",
                config.sources
            )));
        }
        if registry.sources() != config.sources {
            return Err(OracleError::Config(format!(
                "breaker registry covers {:?}, expected {:?}",
                registry.sources(),
                config.sources
            )));
        }

        Ok(Self {
            config,
            sources,
            registry,
            cache: None,
        })
    }

    /// Attach the last-good-price cache
    ///
    /// Every validated upstream quote is written here without the request
    /// waiting on it. With `stale_fallback` on, the cached quote is served
    /// before the static default once every source has failed.
    ///
    /// # Example
    /// ```rust,ignore
    /// let oracle = PriceOracle::new(config, sources)?
    ///     .with_cache(Arc::new(MemoryPriceCache::new()));
    /// ```
    pub fn with_cache(mut self, cache: Arc<dyn PriceCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Replace the breaker registry with fresh breakers driven by `clock`
    ///
    /// Cooldowns and response times are measured on this clock, so tests can
    /// pass a `ManualClock` and step through a cooldown without sleeping.
    /// Counters and states start over.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.registry = Arc::new(MetricsRegistry::new(
            &self.config.sources,
            self.config.breaker(),
            clock,
        ));
        self
    }

    pub fn sources(&self) -> &[SourceId] {
        &self.config.sources
    }

    /// Get the BTC/USD price
    ///
    /// # Algorithm
    /// 1. Chain = `[source_override]` if given, else every configured source
    /// 2. For each source: skip it if its breaker refuses the call,
    ///    otherwise fetch under the per-call timeout and validate
    /// 3. The first validated price is returned immediately
    /// 4. Every failure is recorded against the source's breaker and added
    ///    to `errors`
    /// 5. With the chain exhausted, fall back to the cached last-good price
    ///    (when enabled) and then to the static default
    ///
    /// Never fails: every failure mode degrades to a returned quote.
    pub async fn get_price(&self, source_override: Option<SourceId>) -> PriceQuote {
        let started = Instant::now();
        let mut errors = Vec::new();

        let chain: Vec<&Arc<dyn PriceSource>> = match source_override {
            Some(id) => match self.sources.iter().find(|s| s.id() == id) {
                Some(source) => vec![source],
                None => {
                    errors.push(OracleError::SourceNotConfigured(id).to_string());
                    Vec::new()
                }
            },
            None => self.sources.iter().collect(),
        };

        debug!(
            "Source order: {}",
            chain.iter().map(|s| s.id().as_str()).collect::<Vec<_>>().join(" → ")
        );

        for source in chain {
            let id = source.id();
            let Some(breaker) = self.registry.breaker(id) else {
                errors.push(format!("{id}: no circuit breaker registered"));
                continue;
            };

            let Some(permit) = breaker.try_acquire() else {
                debug!("{} circuit is open, skipping", id);
                errors.push(format!("{id}: circuit breaker open, call skipped"));
                continue;
            };
            if permit.is_trial() {
                info!("{} cooldown elapsed, sending recovery trial", id);
            }

            match self.fetch_validated(source.as_ref()).await {
                Ok(price) => {
                    permit.succeed();
                    let quote = self.upstream_quote(price, id, errors);
                    info!(
                        "BTC price ${} from {} ({}ms)",
                        quote.price,
                        id,
                        started.elapsed().as_millis()
                    );
                    self.store_in_cache(&quote);
                    return quote;
                }
                Err(err) => {
                    permit.fail();
                    if err.is_rate_limited() {
                        info!("{} rate limited, trying next source", id);
                    } else {
                        warn!(status = ?err.status(), "{} failed: {}", id, err);
                    }
                    errors.push(format!("{id}: {err}"));
                }
            }
        }

        self.fallback_quote(errors).await
    }

    /// `true` for every source whose circuit is not open
    pub fn get_health_status(&self) -> BTreeMap<SourceId, bool> {
        self.registry.health_status()
    }

    pub fn get_service_metrics(&self) -> ServiceMetrics {
        ServiceMetrics::collect(&self.registry, &self.config)
    }

    /// Force every breaker back to Closed. Never called on the request path.
    pub fn reset_circuit_breakers(&self) {
        self.registry.reset_all();
    }

    /// Drop the cached last-good price
    ///
    /// A no-op when no cache is attached. Unlike the request path, cache
    /// errors are returned to the caller.
    pub async fn invalidate_cache(&self) -> Result<()> {
        let Some(cache) = self.cache.as_ref() else {
            return Ok(());
        };

        cache.clear().await?;
        info!("BTC price cache invalidated");
        Ok(())
    }

    /// Cache backend health, `None` when no cache is attached
    pub async fn cache_health(&self) -> Option<bool> {
        let cache = self.cache.as_ref()?;
        Some(cache.health_check().await)
    }

    async fn fetch_validated(&self, source: &dyn PriceSource) -> std::result::Result<f64, SourceError> {
        let timeout = self.config.per_call_timeout();

        // Dropping the fetch future on timeout cancels the in-flight request
        let raw = tokio::time::timeout(timeout, source.fetch())
            .await
            .map_err(|_| SourceError::Timeout(timeout))??;

        validate_quote(&raw)
    }

    fn upstream_quote(&self, price: f64, source: SourceId, errors: Vec<String>) -> PriceQuote {
        let is_primary = self.config.sources.first() == Some(&source);

        PriceQuote {
            price,
            source,
            confidence: if is_primary { Confidence::High } else { Confidence::Medium },
            fallback_used: !is_primary,
            errors,
            circuit_breaker_metrics: self.registry.snapshot(),
            timestamp: Utc::now(),
        }
    }

    async fn fallback_quote(&self, errors: Vec<String>) -> PriceQuote {
        let cached = if self.config.stale_fallback {
            self.last_good_quote().await
        } else {
            None
        };

        let (price, source, timestamp) = match cached {
            Some(cached) => {
                warn!("All price sources failed, serving cached price ${}", cached.price);
                (cached.price, SourceId::Cached, cached.timestamp)
            }
            None => {
                warn!(
                    "All price sources failed, using static default ${}. Errors: {:?}",
                    self.config.default_price, errors
                );
                (self.config.default_price, SourceId::Default, Utc::now())
            }
        };

        PriceQuote {
            price,
            source,
            confidence: Confidence::Low,
            fallback_used: true,
            errors,
            circuit_breaker_metrics: self.registry.snapshot(),
            timestamp,
        }
    }

    async fn last_good_quote(&self) -> Option<PriceQuote> {
        let cache = self.cache.as_ref()?;

        match tokio::time::timeout(self.config.per_call_timeout(), cache.get()).await {
            Ok(Ok(Some(quote))) if validate_price(quote.price).is_ok() => Some(quote),
            Ok(Ok(_)) => None,
            Ok(Err(e)) => {
                warn!("Failed to read cached BTC price: {}", e);
                None
            }
            Err(_) => {
                warn!("Timed out reading cached BTC price");
                None
            }
        }
    }

    /// Fire-and-forget write; the caller never waits on the cache.
    fn store_in_cache(&self, quote: &PriceQuote) {
        let Some(cache) = self.cache.clone() else {
            return;
        };
        let quote = quote.clone();

        tokio::spawn(async move {
            if let Err(e) = cache.set(&quote).await {
                warn!("Failed to cache BTC price: {}", e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryPriceCache;
    use crate::circuit_breaker::CircuitState;
    use crate::clock::ManualClock;
    use crate::types::RawQuote;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Debug, Clone)]
    enum Behavior {
        Price(Option<f64>),
        Fail(SourceError),
        Slow(Duration, f64),
        Hang,
    }

    struct FakeSource {
        id: SourceId,
        behavior: Mutex<Behavior>,
        calls: AtomicUsize,
    }

    impl FakeSource {
        fn new(id: SourceId, behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                id,
                behavior: Mutex::new(behavior),
                calls: AtomicUsize::new(0),
            })
        }

        fn set(&self, behavior: Behavior) {
            *self.behavior.lock().unwrap() = behavior;
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PriceSource for FakeSource {
        fn id(&self) -> SourceId {
            self.id
        }

        async fn fetch(&self) -> std::result::Result<RawQuote, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let behavior = self.behavior.lock().unwrap().clone();
            let price = match behavior {
                Behavior::Price(price) => price,
                Behavior::Fail(err) => return Err(err),
                Behavior::Slow(delay, price) => {
                    tokio::time::sleep(delay).await;
                    Some(price)
                }
                Behavior::Hang => std::future::pending().await,
            };
            Ok(RawQuote { source: self.id, price })
        }
    }

    struct FailingCache;

    #[async_trait]
    impl PriceCache for FailingCache {
        async fn get(&self) -> Result<Option<PriceQuote>> {
            Err(OracleError::Cache("unavailable".into()))
        }

        async fn set(&self, _quote: &PriceQuote) -> Result<()> {
            Err(OracleError::Cache("unavailable".into()))
        }

        async fn clear(&self) -> Result<()> {
            Err(OracleError::Cache("unavailable".into()))
        }

        async fn health_check(&self) -> bool {
            false
        }
    }

    fn test_config() -> OracleConfig {
        OracleConfig {
            per_call_timeout_ms: 100,
            ..OracleConfig::default()
        }
    }

    struct Harness {
        oracle: PriceOracle,
        clock: Arc<ManualClock>,
        coingecko: Arc<FakeSource>,
        binance: Arc<FakeSource>,
    }

    fn harness(config: OracleConfig) -> Harness {
        let coingecko = FakeSource::new(SourceId::CoinGecko, Behavior::Price(Some(50000.0)));
        let binance = FakeSource::new(SourceId::Binance, Behavior::Price(Some(50100.0)));
        let clock = Arc::new(ManualClock::new());

        let sources: Vec<Arc<dyn PriceSource>> = vec![coingecko.clone(), binance.clone()];
        let oracle = PriceOracle::new(config, sources)
            .unwrap()
            .with_clock(clock.clone());

        Harness {
            oracle,
            clock,
            coingecko,
            binance,
        }
    }

    fn spawn_price(oracle: &Arc<PriceOracle>) -> tokio::task::JoinHandle<PriceQuote> {
        let oracle = oracle.clone();
        tokio::spawn(async move { oracle.get_price(None).await })
    }

    async fn wait_for_calls(source: &FakeSource, calls: usize) {
        while source.calls() < calls {
            tokio::task::yield_now().await;
        }
    }

    async fn open_primary(h: &Harness) {
        h.coingecko.set(Behavior::Fail(SourceError::RateLimited));
        for _ in 0..3 {
            h.oracle.get_price(None).await;
        }
        assert_eq!(h.oracle.get_health_status()[&SourceId::CoinGecko], false);
    }

    #[tokio::test]
    async fn test_healthy_primary_is_high_confidence() {
        let h = harness(test_config());

        let quote = h.oracle.get_price(None).await;

        assert_eq!(quote.price, 50000.0);
        assert_eq!(quote.source, SourceId::CoinGecko);
        assert_eq!(quote.confidence, Confidence::High);
        assert!(!quote.fallback_used);
        assert!(quote.errors.is_empty());
        assert_eq!(h.binance.calls(), 0);

        let metrics = &quote.circuit_breaker_metrics[&SourceId::CoinGecko];
        assert_eq!(metrics.state, CircuitState::Closed);
        assert_eq!(metrics.total_successes, 1);
        assert_eq!(metrics.total_failures, 0);
    }

    #[tokio::test]
    async fn test_rate_limited_primary_opens_and_falls_back() {
        let h = harness(test_config());
        open_primary(&h).await;

        let metrics = h.oracle.get_service_metrics();
        assert_eq!(metrics.circuit_breakers[&SourceId::CoinGecko].state, CircuitState::Open);
        assert_eq!(metrics.circuit_breakers[&SourceId::CoinGecko].total_failures, 3);

        // Upstream recovers, but the circuit stays open for the cooldown
        h.coingecko.set(Behavior::Price(Some(50000.0)));
        let quote = h.oracle.get_price(None).await;

        assert_eq!(quote.source, SourceId::Binance);
        assert_eq!(quote.price, 50100.0);
        assert_eq!(quote.confidence, Confidence::Medium);
        assert!(quote.fallback_used);
        assert_eq!(h.coingecko.calls(), 3);
        assert!(quote.errors.iter().any(|e| e.contains("circuit breaker open")));
    }

    #[tokio::test]
    async fn test_rate_limit_error_is_reported() {
        let h = harness(test_config());
        h.coingecko.set(Behavior::Fail(SourceError::RateLimited));

        let quote = h.oracle.get_price(None).await;

        assert_eq!(quote.source, SourceId::Binance);
        assert!(quote.fallback_used);
        assert!(quote.errors.iter().any(|e| e.contains("429")));
    }

    #[tokio::test]
    async fn test_all_sources_blocked_returns_default() {
        let h = harness(test_config());
        h.coingecko.set(Behavior::Fail(SourceError::LegalRestriction));
        h.binance.set(Behavior::Fail(SourceError::LegalRestriction));

        let quote = h.oracle.get_price(None).await;

        assert_eq!(quote.source, SourceId::Default);
        assert_eq!(quote.price, 50000.0);
        assert_eq!(quote.confidence, Confidence::Low);
        assert!(quote.fallback_used);
        assert_eq!(quote.errors.len(), 2);
        assert!(quote.errors[0].starts_with("coingecko: "));
        assert!(quote.errors[1].contains("451"));
    }

    #[tokio::test]
    async fn test_invalid_payload_counts_as_failure() {
        for bad in [None, Some(-1000.0)] {
            let h = harness(test_config());
            h.coingecko.set(Behavior::Price(bad));

            let quote = h.oracle.get_price(None).await;

            assert_eq!(quote.source, SourceId::Binance);
            assert!(quote.errors[0].contains("invalid price data"));
            let metrics = &quote.circuit_breaker_metrics[&SourceId::CoinGecko];
            assert_eq!(metrics.total_failures, 1);
            assert_eq!(metrics.consecutive_failures, 1);
            assert_eq!(metrics.total_successes, 0);
        }
    }

    #[tokio::test]
    async fn test_invalid_payload_opens_circuit() {
        let h = harness(test_config());
        h.coingecko.set(Behavior::Price(Some(0.0)));

        for _ in 0..3 {
            h.oracle.get_price(None).await;
        }

        assert_eq!(h.oracle.get_health_status()[&SourceId::CoinGecko], false);
    }

    #[tokio::test]
    async fn test_slow_source_times_out() {
        let h = harness(test_config());
        h.coingecko.set(Behavior::Hang);

        let quote = h.oracle.get_price(None).await;

        assert_eq!(quote.source, SourceId::Binance);
        assert!(quote.errors[0].contains("timed out after 100ms"));
        assert_eq!(quote.circuit_breaker_metrics[&SourceId::CoinGecko].total_failures, 1);
    }

    #[tokio::test]
    async fn test_cooldown_admits_recovery_trial() {
        let h = harness(test_config());
        open_primary(&h).await;
        h.coingecko.set(Behavior::Price(Some(50000.0)));

        h.clock.advance(Duration::from_secs(30));
        let quote = h.oracle.get_price(None).await;

        assert_eq!(quote.source, SourceId::CoinGecko);
        assert_eq!(quote.confidence, Confidence::High);
        let metrics = &quote.circuit_breaker_metrics[&SourceId::CoinGecko];
        assert_eq!(metrics.state, CircuitState::Closed);
        assert_eq!(metrics.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_trial() {
        let h = harness(test_config());
        open_primary(&h).await;
        h.coingecko.set(Behavior::Slow(Duration::from_millis(80), 50000.0));
        h.clock.advance(Duration::from_secs(30));

        let oracle = Arc::new(h.oracle);
        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let oracle = oracle.clone();
            tasks.spawn(async move { oracle.get_price(None).await });
        }

        let mut sources = Vec::new();
        while let Some(quote) = tasks.join_next().await {
            sources.push(quote.unwrap().source);
        }

        assert_eq!(h.coingecko.calls(), 4);
        assert_eq!(sources.iter().filter(|s| **s == SourceId::CoinGecko).count(), 1);
        assert_eq!(sources.iter().filter(|s| **s == SourceId::Binance).count(), 7);
    }

    #[tokio::test]
    async fn test_override_uses_only_that_source() {
        let h = harness(test_config());

        let quote = h.oracle.get_price(Some(SourceId::Binance)).await;

        assert_eq!(quote.source, SourceId::Binance);
        assert_eq!(quote.confidence, Confidence::Medium);
        assert!(quote.fallback_used);
        assert_eq!(h.coingecko.calls(), 0);
    }

    #[tokio::test]
    async fn test_override_respects_breaker() {
        let h = harness(test_config());
        open_primary(&h).await;

        let quote = h.oracle.get_price(Some(SourceId::CoinGecko)).await;

        assert_eq!(quote.source, SourceId::Default);
        assert_eq!(h.coingecko.calls(), 3);
        assert_eq!(quote.errors, vec!["coingecko: circuit breaker open, call skipped".to_string()]);
    }

    #[tokio::test]
    async fn test_unconfigured_override_degrades_to_default() {
        let config = OracleConfig {
            sources: vec![SourceId::CoinGecko],
            ..test_config()
        };
        let source = FakeSource::new(SourceId::CoinGecko, Behavior::Price(Some(50000.0)));
        let sources: Vec<Arc<dyn PriceSource>> = vec![source.clone()];
        let oracle = PriceOracle::new(config, sources).unwrap();

        let quote = oracle.get_price(Some(SourceId::Binance)).await;

        assert_eq!(quote.source, SourceId::Default);
        assert!(quote.errors[0].contains("not configured"));
        assert_eq!(source.calls(), 0);
    }

    #[tokio::test]
    async fn test_reset_restores_health() {
        let h = harness(test_config());
        open_primary(&h).await;
        h.binance.set(Behavior::Fail(SourceError::ServerError(503)));
        for _ in 0..3 {
            h.oracle.get_price(None).await;
        }
        assert!(h.oracle.get_health_status().values().all(|healthy| !*healthy));

        h.oracle.reset_circuit_breakers();

        assert!(h.oracle.get_health_status().values().all(|healthy| *healthy));
    }

    #[tokio::test]
    async fn test_service_metrics_are_idempotent() {
        let h = harness(test_config());
        h.coingecko.set(Behavior::Fail(SourceError::ServerError(500)));
        h.oracle.get_price(None).await;

        let first = h.oracle.get_service_metrics();
        let second = h.oracle.get_service_metrics();

        assert_eq!(first, second);
        assert_eq!(first.sources, vec![SourceId::CoinGecko, SourceId::Binance]);
        assert_eq!(first.configuration.failure_threshold, 3);
        assert_eq!(first.circuit_breakers[&SourceId::CoinGecko].request_count, 1);
        assert_eq!(first.circuit_breakers[&SourceId::Binance].request_count, 1);
    }

    #[tokio::test]
    async fn test_cancelled_trial_frees_slot_once() {
        let h = harness(OracleConfig {
            per_call_timeout_ms: 5_000,
            ..OracleConfig::default()
        });
        open_primary(&h).await;
        h.coingecko.set(Behavior::Hang);
        h.clock.advance(Duration::from_secs(30));
        let oracle = Arc::new(h.oracle);

        let trial = spawn_price(&oracle);
        wait_for_calls(&h.coingecko, 4).await;

        // Trial slot taken: the primary is skipped
        let quote = oracle.get_price(None).await;
        assert_eq!(quote.source, SourceId::Binance);
        assert_eq!(h.coingecko.calls(), 4);

        trial.abort();
        assert!(trial.await.unwrap_err().is_cancelled());

        // Exactly one new trial takes the freed slot
        let second_trial = spawn_price(&oracle);
        wait_for_calls(&h.coingecko, 5).await;
        let quote = oracle.get_price(None).await;
        assert_eq!(quote.source, SourceId::Binance);
        assert_eq!(h.coingecko.calls(), 5);

        let metrics = &quote.circuit_breaker_metrics[&SourceId::CoinGecko];
        assert_eq!(metrics.state, CircuitState::HalfOpen);
        assert_eq!(metrics.total_failures, 3);

        second_trial.abort();
        assert!(second_trial.await.unwrap_err().is_cancelled());

        h.coingecko.set(Behavior::Price(Some(50000.0)));
        let quote = oracle.get_price(None).await;
        assert_eq!(quote.source, SourceId::CoinGecko);
        assert_eq!(quote.circuit_breaker_metrics[&SourceId::CoinGecko].state, CircuitState::Closed);
        assert_eq!(h.coingecko.calls(), 6);
    }

    #[tokio::test]
    async fn test_cancelled_request_from_closed_circuit_keeps_trial_exclusive() {
        let h = harness(OracleConfig {
            per_call_timeout_ms: 5_000,
            ..OracleConfig::default()
        });
        h.coingecko.set(Behavior::Hang);
        let oracle = Arc::new(h.oracle);

        let earlier = spawn_price(&oracle);
        wait_for_calls(&h.coingecko, 1).await;

        // Circuit opens and cools down underneath the in-flight request
        let breaker = oracle.registry.breaker(SourceId::CoinGecko).unwrap();
        for _ in 0..3 {
            breaker.on_failure();
        }
        h.clock.advance(Duration::from_secs(30));

        let trial = spawn_price(&oracle);
        wait_for_calls(&h.coingecko, 2).await;

        earlier.abort();
        assert!(earlier.await.unwrap_err().is_cancelled());

        let quote = oracle.get_price(None).await;
        assert_eq!(quote.source, SourceId::Binance);
        assert_eq!(h.coingecko.calls(), 2);
        assert!(quote.errors[0].contains("circuit breaker open"));

        trial.abort();
        assert!(trial.await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_invalidate_cache() {
        let h = harness(test_config());
        let quote = h.oracle.get_price(None).await;

        let cache = Arc::new(MemoryPriceCache::new());
        let oracle = h.oracle.with_cache(cache.clone());
        cache.set(&quote).await.unwrap();

        oracle.invalidate_cache().await.unwrap();

        assert!(cache.get().await.unwrap().is_none());
        assert_eq!(oracle.cache_health().await, Some(true));
    }

    #[tokio::test]
    async fn test_invalidate_cache_reports_backend_errors() {
        let h = harness(test_config());
        assert!(h.oracle.invalidate_cache().await.is_ok());
        assert_eq!(h.oracle.cache_health().await, None);

        let oracle = h.oracle.with_cache(Arc::new(FailingCache));
        assert!(matches!(oracle.invalidate_cache().await, Err(OracleError::Cache(_))));
        assert_eq!(oracle.cache_health().await, Some(false));
    }

    #[tokio::test]
    async fn test_success_is_written_to_cache() {
        let cache = Arc::new(MemoryPriceCache::new());
        let h = harness(test_config());
        let oracle = h.oracle.with_cache(cache.clone());

        oracle.get_price(None).await;

        let mut cached = None;
        for _ in 0..50 {
            cached = cache.get().await.unwrap();
            if cached.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(cached.map(|q| q.price), Some(50000.0));
    }

    #[tokio::test]
    async fn test_cache_failure_does_not_affect_quote() {
        let h = harness(test_config());
        let oracle = h.oracle.with_cache(Arc::new(FailingCache));

        let quote = oracle.get_price(None).await;

        assert_eq!(quote.source, SourceId::CoinGecko);
        assert_eq!(quote.confidence, Confidence::High);
        assert!(quote.errors.is_empty());
    }

    #[tokio::test]
    async fn test_stale_fallback_serves_cached_price() {
        let cache = Arc::new(MemoryPriceCache::new());
        let h = harness(OracleConfig {
            stale_fallback: true,
            ..test_config()
        });

        // Seed the cache through a normal successful request
        let oracle = h.oracle.with_cache(cache.clone());
        oracle.get_price(None).await;
        for _ in 0..50 {
            if cache.get().await.unwrap().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        h.coingecko.set(Behavior::Fail(SourceError::Transport("connection reset".into())));
        h.binance.set(Behavior::Fail(SourceError::Transport("connection reset".into())));
        let quote = oracle.get_price(None).await;

        assert_eq!(quote.source, SourceId::Cached);
        assert_eq!(quote.price, 50000.0);
        assert_eq!(quote.confidence, Confidence::Low);
        assert!(quote.fallback_used);
        assert_eq!(quote.errors.len(), 2);
    }

    #[tokio::test]
    async fn test_stale_fallback_skips_broken_cache() {
        let h = harness(OracleConfig {
            stale_fallback: true,
            ..test_config()
        });
        h.coingecko.set(Behavior::Fail(SourceError::ClientError(404)));
        h.binance.set(Behavior::Fail(SourceError::ClientError(404)));
        let oracle = h.oracle.with_cache(Arc::new(FailingCache));

        let quote = oracle.get_price(None).await;

        assert_eq!(quote.source, SourceId::Default);
    }

    #[test]
    fn test_rejects_empty_source_list() {
        let config = OracleConfig {
            sources: Vec::new(),
            ..OracleConfig::default()
        };
        assert!(matches!(
            PriceOracle::new(config, Vec::new()),
            Err(OracleError::Config(_))
        ));
    }

    #[test]
    fn test_rejects_clients_out_of_order() {
        let coingecko = FakeSource::new(SourceId::CoinGecko, Behavior::Price(Some(1.0)));
        let binance = FakeSource::new(SourceId::Binance, Behavior::Price(Some(1.0)));

        let sources: Vec<Arc<dyn PriceSource>> = vec![binance, coingecko];
        let result = PriceOracle::new(OracleConfig::default(), sources);
        assert!(matches!(result, Err(OracleError::Config(_))));
    }
}
