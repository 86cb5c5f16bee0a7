//! # HASIVU Server
//!
//! HTTP control plane for the HASIVU integration runtime.
//!
//! The server owns one [`AppState`] holding the job queue and its worker
//! pool, the data-flow orchestrator, the integration orchestrator with its
//! circuit breakers, and the monitoring engines. Everything is exposed under
//! `/api/v1`; see [`routes::v1`] for the route table.

pub mod api_types;
pub mod handlers;
pub mod infra;
pub mod routes;

use axum::Router;
use tower_http::trace::TraceLayer;

pub use infra::app_state::AppState;

/// Full application router with request tracing attached.
pub fn create_app(state: AppState) -> Router {
    routes::create_api_router()
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
