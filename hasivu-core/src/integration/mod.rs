//! Component lifecycle management.
//!
//! Subsystems implement [`IntegrationComponent`] and are registered with an
//! [`IntegrationOrchestrator`], which connects them in dependency order,
//! guards every call with a per-component circuit breaker and aggregates
//! their health into a single [`SystemHealth`].

pub mod component;
pub mod components;
pub mod orchestrator;

pub use component::{
    ComponentHealth, ComponentKind, HealthStatus, IntegrationComponent, LifecycleState, SyncReport,
};
pub use components::{HttpServiceComponent, PipelineComponent, QueueComponent};
pub use orchestrator::{
    ComponentFailure, ComponentReport, IntegrationOrchestrator, StartReport, SyncOutcome,
    SystemHealth,
};
