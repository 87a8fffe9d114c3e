use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use btc_price_oracle::{
    api::{create_router, AppState},
    binance_client::BinanceClient,
    cache::{MemoryPriceCache, PriceCache, RedisPriceCache},
    coingecko_client::CoinGeckoClient,
    config::Config,
    http_client::{HttpTransport, ReqwestTransport},
    source::PriceSource,
    types::SourceId,
    PriceOracle,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::info!("🚀 Starting BTC Price Oracle...");

    let config = Config::from_env().context("invalid configuration")?;
    let oracle_config = config.oracle_config.clone();

    // Build one client per configured source, in fallback order
    let transport: Arc<dyn HttpTransport> = Arc::new(ReqwestTransport::new());
    let timeout = oracle_config.per_call_timeout();
    let sources: Vec<Arc<dyn PriceSource>> = oracle_config
        .sources
        .iter()
        .filter_map(|source| -> Option<Arc<dyn PriceSource>> {
            match source {
                SourceId::CoinGecko => Some(Arc::new(CoinGeckoClient::new(
                    transport.clone(),
                    &config.coingecko_base_url,
                    timeout,
                ))),
                SourceId::Binance => Some(Arc::new(BinanceClient::new(
                    transport.clone(),
                    &config.binance_base_url,
                    timeout,
                ))),
                SourceId::Cached | SourceId::Default => None,
            }
        })
        .collect();
    tracing::info!(
        "🔗 Price sources: {}",
        oracle_config.sources.iter().map(SourceId::as_str).collect::<Vec<_>>().join(" → ")
    );

    // Initialize last-good-price cache
    let cache: Arc<dyn PriceCache> = match &config.redis_url {
        Some(redis_url) => {
            tracing::info!("💾 Connecting to Redis...");
            Arc::new(
                RedisPriceCache::new(redis_url)
                    .await
                    .context("failed to connect to Redis")?
                    .with_ttl(config.cache_ttl_seconds),
            )
        }
        None => {
            tracing::warn!("REDIS_URL not set; last good price is kept in memory only");
            Arc::new(MemoryPriceCache::new())
        }
    };

    let oracle = PriceOracle::new(oracle_config, sources)?.with_cache(cache);
    let app = create_router(AppState {
        oracle: Arc::new(oracle),
    });

    let addr = format!("{}:{}", config.server_host, config.server_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    tracing::info!("🌐 Server listening on {}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}
