//! REST API
//!
//! Provides HTTP endpoints for the BTC price, breaker health and metrics.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::{
    error::{OracleError, Result},
    metrics::ServiceMetrics,
    oracle::PriceOracle,
    types::{PriceQuote, SourceId},
};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub oracle: Arc<PriceOracle>,
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Price endpoints
        .route("/api/v1/price", get(get_price))
        // Health endpoints
        .route("/api/v1/health", get(health_check))
        .route("/api/v1/metrics", get(service_metrics))
        // Admin endpoints
        .route("/api/v1/admin/circuit-breakers/reset", post(reset_circuit_breakers))
        .route("/api/v1/admin/cache/clear", post(clear_cache))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ============================================================================
// PRICE ENDPOINTS
// ============================================================================

/// GET /api/v1/price
///
/// Current BTC/USD price. Always answers with a quote; a degraded
/// `confidence` and non-empty `errors` mark a fallback.
///
/// Query params: ?source=binance (optional, skips the fallback chain)
async fn get_price(
    State(state): State<AppState>,
    Query(params): Query<PriceQuery>,
) -> Result<Json<PriceResponse>> {
    let source_override = match params.source.as_deref() {
        Some(name) => {
            let source: SourceId = name.parse()?;
            if !state.oracle.sources().contains(&source) {
                return Err(OracleError::SourceNotConfigured(source));
            }
            Some(source)
        }
        None => None,
    };

    let quote = state.oracle.get_price(source_override).await;

    Ok(Json(PriceResponse {
        success: true,
        data: quote,
    }))
}

// ============================================================================
// HEALTH ENDPOINTS
// ============================================================================

/// GET /api/v1/health
///
/// Per-source breaker health plus cache health; `success` is false while any
/// circuit is open or an attached cache is unreachable
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let health = state.oracle.get_health_status();
    let cache_healthy = state.oracle.cache_health().await;

    let all_healthy = health.values().all(|healthy| *healthy) && cache_healthy != Some(false);

    Json(HealthResponse {
        success: all_healthy,
        data: health,
        cache: cache_healthy,
        timestamp: chrono::Utc::now().timestamp(),
    })
}

/// GET /api/v1/metrics
async fn service_metrics(State(state): State<AppState>) -> Json<MetricsResponse> {
    Json(MetricsResponse {
        success: true,
        data: state.oracle.get_service_metrics(),
    })
}

// ============================================================================
// ADMIN ENDPOINTS
// ============================================================================

/// POST /api/v1/admin/circuit-breakers/reset
async fn reset_circuit_breakers(State(state): State<AppState>) -> Json<AdminResponse> {
    state.oracle.reset_circuit_breakers();
    info!("Circuit breakers reset via admin API");

    Json(AdminResponse {
        success: true,
        message: "Circuit breakers reset".to_string(),
    })
}

/// POST /api/v1/admin/cache/clear
///
/// Drop the cached last-good price
async fn clear_cache(State(state): State<AppState>) -> Result<Json<AdminResponse>> {
    state.oracle.invalidate_cache().await?;

    Ok(Json(AdminResponse {
        success: true,
        message: "Cache cleared".to_string(),
    }))
}

// ============================================================================
// REQUEST/RESPONSE TYPES
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct PriceQuery {
    pub source: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PriceResponse {
    pub success: bool,
    pub data: PriceQuote,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub success: bool,
    pub data: BTreeMap<SourceId, bool>,

    /// `None` when no cache is attached
    pub cache: Option<bool>,

    pub timestamp: i64,
}

#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    pub success: bool,
    pub data: ServiceMetrics,
}

#[derive(Debug, Serialize)]
pub struct AdminResponse {
    pub success: bool,
    pub message: String,
}

// ============================================================================
// ERROR HANDLING
// ============================================================================

impl IntoResponse for OracleError {
    fn into_response(self) -> Response {
        let status = match self {
            OracleError::UnknownSource(_) | OracleError::SourceNotConfigured(_) => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(serde_json::json!({
            "success": false,
            "error": self.to_string(),
        }));

        (status, body).into_response()
    }
}
