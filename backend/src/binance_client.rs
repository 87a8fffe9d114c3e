use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::SourceError;
use crate::http_client::HttpTransport;
use crate::source::{parse_json, price_field, PriceSource};
use crate::types::{RawQuote, SourceId};

pub const DEFAULT_BINANCE_URL: &str = "https://api.binance.com/api/v3";

/// Client for the Binance spot ticker API
///
/// Binance quotes BTC against USDT, which is treated as USD.
pub struct BinanceClient {
    transport: Arc<dyn HttpTransport>,
    base_url: String,
    timeout: Duration,
}

impl BinanceClient {
    pub fn new(transport: Arc<dyn HttpTransport>, base_url: &str, timeout: Duration) -> Self {
        Self {
            transport,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        }
    }

    fn price_url(&self) -> String {
        format!("{}/ticker/price?symbol=BTCUSDT", self.base_url)
    }
}

#[async_trait]
impl PriceSource for BinanceClient {
    fn id(&self) -> SourceId {
        SourceId::Binance
    }

    async fn fetch(&self) -> Result<RawQuote, SourceError> {
        let url = self.price_url();
        debug!("Fetching Binance price from {}", url);

        let response = self.transport.get(&url, self.timeout).await?;
        let body = parse_json(&response)?;

        // { "symbol": "BTCUSDT", "price": "50000.00" }
        let price = price_field(body.get("price"));

        Ok(RawQuote {
            source: SourceId::Binance,
            price,
        })
    }
}
