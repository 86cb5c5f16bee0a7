use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::info;

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStatus, CircuitState};

#[derive(Clone, Debug, Serialize)]
pub struct SystemCircuitStatus {
    pub sampled_at: DateTime<Utc>,
    pub total: usize,
    pub state_summary: BTreeMap<CircuitState, usize>,
    pub breakers: BTreeMap<String, CircuitBreakerStatus>,
}

/// Named breakers shared across components.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    defaults: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(defaults: CircuitBreakerConfig) -> Self {
        Self {
            defaults,
            breakers: DashMap::new(),
        }
    }

    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_or_create_with(name, self.defaults.clone())
    }

    /// `config` only applies when the breaker does not exist yet.
    pub fn get_or_create_with(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(name) {
            return Arc::clone(existing.value());
        }
        Arc::clone(
            self.breakers
                .entry(name.to_string())
                .or_insert_with(|| {
                    info!(target: "hasivu::resilience", circuit = name, "circuit breaker created");
                    Arc::new(CircuitBreaker::new(name, config))
                })
                .value(),
        )
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    pub fn system_status(&self) -> SystemCircuitStatus {
        let breakers: BTreeMap<String, CircuitBreakerStatus> = self
            .breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().status()))
            .collect();
        let mut state_summary = BTreeMap::new();
        for status in breakers.values() {
            *state_summary.entry(status.state).or_insert(0) += 1;
        }
        SystemCircuitStatus {
            sampled_at: Utc::now(),
            total: breakers.len(),
            state_summary,
            breakers,
        }
    }

    /// True when no breaker is open or forced open. Half-open counts as closed.
    pub fn all_closed(&self) -> bool {
        self.breakers.iter().all(|entry| {
            !matches!(
                entry.value().state(),
                CircuitState::Open | CircuitState::ForcedOpen
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuses_breakers_and_summarises_states() {
        let registry = CircuitBreakerRegistry::default();
        let auth = registry.get_or_create("authentication");
        let again = registry.get_or_create("authentication");
        assert!(Arc::ptr_eq(&auth, &again));
        registry.get_or_create("vendor-marketplace");
        assert!(registry.all_closed());

        auth.force_open("maintenance");
        assert!(!registry.all_closed());

        let status = registry.system_status();
        assert_eq!(status.total, 2);
        assert_eq!(status.state_summary[&CircuitState::ForcedOpen], 1);
        assert_eq!(status.state_summary[&CircuitState::Closed], 1);
        assert_eq!(status.breakers["authentication"].state, CircuitState::ForcedOpen);
        assert!(registry.get("missing").is_none());
    }
}
