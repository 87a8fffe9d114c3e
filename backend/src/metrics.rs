//! Breaker registry and health/metrics snapshots
//!
//! The registry is built once at startup, owns one circuit breaker per
//! configured source and is handed to the oracle by `Arc`. Every read here is
//! network-free and side-effect-free, so it is safe to poll.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use crate::circuit_breaker::{BreakerConfig, CircuitBreaker, CircuitBreakerMetrics, CircuitState};
use crate::clock::Clock;
use crate::config::OracleConfig;
use crate::types::SourceId;

#[derive(Debug)]
pub struct MetricsRegistry {
    /// Breakers in fallback-chain order
    breakers: Vec<CircuitBreaker>,
}

impl MetricsRegistry {
    pub fn new(sources: &[SourceId], config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        let breakers = sources
            .iter()
            .map(|source| CircuitBreaker::new(*source, config, clock.clone()))
            .collect();

        Self { breakers }
    }

    pub fn breaker(&self, source: SourceId) -> Option<&CircuitBreaker> {
        self.breakers.iter().find(|b| b.source() == source)
    }

    pub fn sources(&self) -> Vec<SourceId> {
        self.breakers.iter().map(CircuitBreaker::source).collect()
    }

    pub fn snapshot(&self) -> BTreeMap<SourceId, CircuitBreakerMetrics> {
        self.breakers
            .iter()
            .map(|b| (b.source(), b.metrics()))
            .collect()
    }

    /// `true` for every source whose circuit is not open
    pub fn health_status(&self) -> BTreeMap<SourceId, bool> {
        self.breakers
            .iter()
            .map(|b| (b.source(), b.state() != CircuitState::Open))
            .collect()
    }

    /// Force every breaker back to Closed. Operational recovery only.
    pub fn reset_all(&self) {
        for breaker in &self.breakers {
            breaker.reset();
        }
        info!("Reset {} circuit breakers", self.breakers.len());
    }
}

/// Composite snapshot for health dashboards
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceMetrics {
    pub circuit_breakers: BTreeMap<SourceId, CircuitBreakerMetrics>,
    pub health_status: BTreeMap<SourceId, bool>,
    pub configuration: OracleConfig,
    pub sources: Vec<SourceId>,
}

impl ServiceMetrics {
    pub fn collect(registry: &MetricsRegistry, configuration: &OracleConfig) -> Self {
        let circuit_breakers = registry.snapshot();
        let health_status = circuit_breakers
            .iter()
            .map(|(source, metrics)| (*source, metrics.is_healthy))
            .collect();

        Self {
            circuit_breakers,
            health_status,
            configuration: configuration.clone(),
            sources: registry.sources(),
        }
    }
}
