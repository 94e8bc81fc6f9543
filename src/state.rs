use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::config::AppConfig;
use crate::continuation::Orchestrator;
use crate::error::GatewayError;
use crate::transport::HttpTransport;

/// Per-process response id source: a random seed mixed with a counter.
struct ResponseIdGenerator {
    seed: u128,
    counter: AtomicU64,
}

impl ResponseIdGenerator {
    fn new() -> Self {
        let seed_hi = u128::from(fastrand::u64(..));
        let seed_lo = u128::from(fastrand::u64(..));
        Self {
            seed: (seed_hi << 64) | seed_lo,
            counter: AtomicU64::new(1),
        }
    }

    fn next(&self) -> String {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        let uuid = uuid::Uuid::from_u128(self.seed ^ u128::from(seq));
        format!("chatcmpl-{}", uuid.simple())
    }
}

/// Shared application state accessible to all handlers.
pub struct AppState {
    pub config: AppConfig,
    pub orchestrator: Arc<Orchestrator<HttpTransport>>,
    response_ids: ResponseIdGenerator,
    started_at: Instant,
}

impl AppState {
    /// Build the upstream transport and orchestrator from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] when the upstream client cannot be built.
    pub fn new(config: AppConfig) -> Result<Self, GatewayError> {
        let transport = Arc::new(HttpTransport::new(&config.upstream)?);
        let orchestrator = Arc::new(Orchestrator::from_config(transport, &config));
        Ok(Self {
            config,
            orchestrator,
            response_ids: ResponseIdGenerator::new(),
            started_at: Instant::now(),
        })
    }

    /// A fresh `chatcmpl-` response id.
    #[must_use]
    pub fn next_response_id(&self) -> String {
        self.response_ids.next()
    }

    /// Seconds since the state was created.
    #[must_use]
    pub fn uptime_secs(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_ids_are_unique() {
        let state = AppState::new(AppConfig::default()).unwrap();
        let first = state.next_response_id();
        let second = state.next_response_id();
        assert!(first.starts_with("chatcmpl-"));
        assert_eq!(first.len(), "chatcmpl-".len() + 32);
        assert_ne!(first, second);
    }

    #[test]
    fn test_uptime_is_non_negative() {
        let state = AppState::new(AppConfig::default()).unwrap();
        assert!(state.uptime_secs() >= 0.0);
    }
}
