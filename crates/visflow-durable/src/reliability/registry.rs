//! Per-service breaker registry
//!
//! Constructed once at startup and passed by reference; breakers themselves
//! are created lazily per service name.

use std::sync::Arc;

use dashmap::DashMap;

use super::breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::clock::Clock;
use crate::metrics::SharedMetrics;

/// Registry of named circuit breakers.
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    default_config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    metrics: SharedMetrics,
}

impl BreakerRegistry {
    pub fn new(
        default_config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            breakers: DashMap::new(),
            default_config,
            clock,
            metrics,
        }
    }

    /// Get the breaker for a service, creating it with the default config.
    pub fn get(&self, service: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(service.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    service,
                    self.default_config.clone(),
                    self.clock.clone(),
                    self.metrics.clone(),
                ))
            })
            .clone()
    }

    /// Install a breaker with a service-specific config, replacing any
    /// default-configured one.
    pub fn configure(&self, service: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let breaker = Arc::new(CircuitBreaker::new(
            service,
            config,
            self.clock.clone(),
            self.metrics.clone(),
        ));
        self.breakers.insert(service.to_string(), breaker.clone());
        breaker
    }

    /// Names of all registered services.
    pub fn services(&self) -> Vec<String> {
        self.breakers.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::metrics::NullMetrics;
    use std::time::Duration;

    fn registry() -> BreakerRegistry {
        BreakerRegistry::new(
            CircuitBreakerConfig::default(),
            Arc::new(SystemClock),
            Arc::new(NullMetrics),
        )
    }

    #[test]
    fn get_is_lazy_and_stable() {
        let registry = registry();

        let a = registry.get("casa");
        let b = registry.get("casa");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.services(), vec!["casa".to_string()]);
    }

    #[test]
    fn configure_overrides_default() {
        let registry = registry();
        registry.get("wsclean");

        let custom = CircuitBreakerConfig::default()
            .with_failure_threshold(10)
            .with_recovery_timeout(Duration::from_secs(30));
        let breaker = registry.configure("wsclean", custom.clone());

        assert_eq!(breaker.config(), &custom);
        assert!(Arc::ptr_eq(&registry.get("wsclean"), &breaker));
    }
}
