//! Payload validation
//!
//! A provider can answer 200 and still hand back garbage. Anything rejected
//! here is reported as `SourceError::InvalidData` and counted against the
//! source's breaker exactly like an outage.

use crate::error::SourceError;
use crate::types::RawQuote;

/// Accept a fetched quote only if its price is present, finite and positive.
pub fn validate_quote(quote: &RawQuote) -> Result<f64, SourceError> {
    let price = quote.price.ok_or_else(|| {
        SourceError::InvalidData(format!("{} returned no numeric price", quote.source))
    })?;

    validate_price(price)
}

pub fn validate_price(price: f64) -> Result<f64, SourceError> {
    if !price.is_finite() {
        return Err(SourceError::InvalidData(format!("non-finite price: {price}")));
    }

    if price <= 0.0 {
        return Err(SourceError::InvalidData(format!("non-positive price: {price}")));
    }

    Ok(price)
}
