use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::SourceError;
use crate::http_client::HttpTransport;
use crate::source::{parse_json, price_field, PriceSource};
use crate::types::{RawQuote, SourceId};

pub const DEFAULT_COINGECKO_URL: &str = "https://api.coingecko.com/api/v3";

/// Client for the CoinGecko simple price API
pub struct CoinGeckoClient {
    transport: Arc<dyn HttpTransport>,
    base_url: String,
    timeout: Duration,
}

impl CoinGeckoClient {
    pub fn new(transport: Arc<dyn HttpTransport>, base_url: &str, timeout: Duration) -> Self {
        Self {
            transport,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        }
    }

    fn price_url(&self) -> String {
        format!("{}/simple/price?ids=bitcoin&vs_currencies=usd", self.base_url)
    }
}

#[async_trait]
impl PriceSource for CoinGeckoClient {
    fn id(&self) -> SourceId {
        SourceId::CoinGecko
    }

    async fn fetch(&self) -> Result<RawQuote, SourceError> {
        let url = self.price_url();
        debug!("Fetching CoinGecko price from {}", url);

        let response = self.transport.get(&url, self.timeout).await?;
        let body = parse_json(&response)?;

        // { "bitcoin": { "usd": 50000 } }
        let price = price_field(body.pointer("/bitcoin/usd"));

        Ok(RawQuote {
            source: SourceId::CoinGecko,
            price,
        })
    }
}
