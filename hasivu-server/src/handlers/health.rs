use axum::{Json, extract::State, http::StatusCode};

use hasivu_core::integration::HealthStatus;

use crate::{
    api_types::{ApiResponse, HealthResponse},
    infra::app_state::AppState,
};

/// Aggregated component health plus breaker summary. Answers 503 while the
/// system is unhealthy.
pub async fn health_handler(
    State(state): State<AppState>,
) -> (StatusCode, Json<ApiResponse<HealthResponse>>) {
    let health = state.integration.health().await;
    let status = match health.status {
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    let body = HealthResponse {
        status: health.status,
        checked_at: health.checked_at,
        components: health.components,
        circuits: state.breakers.system_status(),
    };
    (status, Json(ApiResponse::success(body)))
}
