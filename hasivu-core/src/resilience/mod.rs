//! Circuit breakers guarding calls to integration dependencies.

pub mod circuit_breaker;
pub mod registry;

pub use circuit_breaker::{
    AdaptiveThresholds, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStatus, CircuitState,
    CircuitStats,
};
pub use registry::{CircuitBreakerRegistry, SystemCircuitStatus};
