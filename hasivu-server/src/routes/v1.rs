use axum::{
    Router,
    routing::{get, post},
};

use crate::{
    handlers::{circuit_breakers, health, integrations, monitoring, pipelines, queues},
    infra::app_state::AppState,
};

/// Create all v1 API routes
pub fn create_v1_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health::health_handler))
        .merge(create_queue_routes())
        .merge(create_pipeline_routes())
        .merge(create_integration_routes())
        .merge(create_circuit_breaker_routes())
        .merge(create_monitoring_routes())
}

fn create_queue_routes() -> Router<AppState> {
    Router::new()
        .route("/queues/stats", get(queues::queue_stats_handler))
        .route("/queues/{queue}/jobs", post(queues::enqueue_job_handler))
        .route(
            "/jobs/{job_id}",
            get(queues::get_job_handler).delete(queues::cancel_job_handler),
        )
        .route(
            "/queues/{queue}/dead-letters",
            get(queues::list_dead_letters_handler).delete(queues::purge_dead_letters_handler),
        )
        .route(
            "/dead-letters/{job_id}/replay",
            post(queues::replay_dead_letter_handler),
        )
}

fn create_pipeline_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/pipelines",
            get(pipelines::list_pipelines_handler).post(pipelines::create_pipeline_handler),
        )
        .route(
            "/pipelines/{id}",
            get(pipelines::get_pipeline_handler).delete(pipelines::delete_pipeline_handler),
        )
        .route(
            "/pipelines/{id}/runs",
            get(pipelines::list_runs_handler).post(pipelines::trigger_run_handler),
        )
        .route("/pipelines/{id}/checkpoint", get(pipelines::checkpoint_handler))
        .route("/runs", get(pipelines::active_runs_handler))
        .route("/runs/{run_id}", get(pipelines::get_run_handler))
        .route("/runs/{run_id}/cancel", post(pipelines::cancel_run_handler))
}

fn create_integration_routes() -> Router<AppState> {
    Router::new()
        .route("/integrations", get(integrations::list_integrations_handler))
        .route("/integrations/sync", post(integrations::sync_all_handler))
        .route(
            "/integrations/{name}/sync",
            post(integrations::sync_integration_handler),
        )
        .route(
            "/integrations/{name}/restart",
            post(integrations::restart_integration_handler),
        )
}

fn create_circuit_breaker_routes() -> Router<AppState> {
    Router::new()
        .route("/circuit-breakers", get(circuit_breakers::list_breakers_handler))
        .route(
            "/circuit-breakers/{name}",
            get(circuit_breakers::get_breaker_handler),
        )
        .route(
            "/circuit-breakers/{name}/open",
            post(circuit_breakers::open_breaker_handler),
        )
        .route(
            "/circuit-breakers/{name}/close",
            post(circuit_breakers::close_breaker_handler),
        )
}

fn create_monitoring_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/monitoring/anomalies",
            post(monitoring::detect_anomalies_handler),
        )
        .route(
            "/monitoring/anomalies/{alert_id}/feedback",
            post(monitoring::anomaly_feedback_handler),
        )
        .route(
            "/monitoring/baselines",
            post(monitoring::register_baseline_handler),
        )
        .route(
            "/monitoring/report",
            post(monitoring::performance_report_handler),
        )
}
