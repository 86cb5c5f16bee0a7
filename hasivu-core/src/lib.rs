//! # HASIVU Core
//!
//! Integration layer of the HASIVU school food-service platform: the pieces
//! that move data and work between services rather than the services
//! themselves.
//!
//! ## Overview
//!
//! - **Job queue**: priority queue with leases, retry/backoff, dedupe and a
//!   dead-letter store, drained by a weighted-fair worker pool
//! - **Data flow**: batch extract → transform → load pipelines with
//!   classified retries, checkpoint/resume and cron scheduling
//! - **Integration**: lifecycle coordination of external components with
//!   dependency ordering and aggregated health
//! - **Resilience**: adaptive circuit breakers
//! - **Monitoring**: anomaly detection and SLA/trend/capacity analytics
//!
//! ## Architecture
//!
//! - [`queue`]: [`queue::QueueService`] and its in-memory implementation
//! - [`pipeline`]: [`pipeline::DataFlowOrchestrator`] and connectors
//! - [`integration`]: [`integration::IntegrationOrchestrator`] and components
//! - [`resilience`]: [`resilience::CircuitBreaker`] and its registry
//! - [`monitoring`]: [`monitoring::AnomalyDetector`] and analytics
//! - [`runtime`]: in-process event bus shared by the above
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use hasivu_core::config::PipelineDefaults;
//! use hasivu_core::pipeline::{
//!     ConnectorFactory, DataFlowOrchestrator, InMemoryCheckpointStore, PipelineDefinition,
//!     SinkSpec, SourceSpec,
//! };
//! use hasivu_core::types::PipelineId;
//!
//! # async fn demo() -> hasivu_core::error::Result<()> {
//! let orchestrator = DataFlowOrchestrator::new(
//!     PipelineDefaults::default(),
//!     ConnectorFactory::default(),
//!     Arc::new(InMemoryCheckpointStore::default()),
//! );
//! orchestrator.register(PipelineDefinition::new(
//!     PipelineId::new("menu-export"),
//!     "Menu export",
//!     SourceSpec::JsonLines { path: "menus.jsonl".into() },
//!     SinkSpec::Memory { dataset: "menus".into() },
//! ))?;
//! let run = orchestrator.run(&PipelineId::new("menu-export")).await?;
//! println!("{:?} loaded {} records", run.status, run.metrics.loaded);
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(missing_docs)]

/// Runtime configuration sections
pub mod config;

/// Error types shared by every module
pub mod error;

/// Event payloads and publisher traits
pub mod events;

/// Component lifecycle orchestration
pub mod integration;

/// Anomaly detection and performance analytics
pub mod monitoring;

/// Extract → transform → load orchestration
pub mod pipeline;

/// Priority job queue
pub mod queue;

/// Circuit breakers
pub mod resilience;

pub mod runtime;

/// Identifier newtypes
pub mod types;

pub use config::OrchestratorConfig;
pub use error::{CoreError, Result};
