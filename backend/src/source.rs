use async_trait::async_trait;
use serde_json::Value;

use crate::error::SourceError;
use crate::http_client::HttpResponse;
use crate::types::{RawQuote, SourceId};

/// One upstream BTC/USD price provider
///
/// `fetch` performs exactly one network call. The result is not validated;
/// the oracle does that before trusting it.
#[async_trait]
pub trait PriceSource: Send + Sync {
    fn id(&self) -> SourceId;

    async fn fetch(&self) -> Result<RawQuote, SourceError>;
}

/// Turn an HTTP response into a JSON document, classifying error statuses.
pub(crate) fn parse_json(response: &HttpResponse) -> Result<Value, SourceError> {
    if !response.is_success() {
        return Err(SourceError::from_status(response.status).unwrap_or_else(|| {
            SourceError::Transport(format!("unexpected HTTP status {}", response.status))
        }));
    }

    serde_json::from_str(&response.body)
        .map_err(|e| SourceError::InvalidData(format!("malformed JSON: {e}")))
}

/// Read a price that may be a JSON number or a decimal string.
pub(crate) fn price_field(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
