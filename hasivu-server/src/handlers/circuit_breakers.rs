use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
};

use hasivu_core::resilience::{CircuitBreaker, CircuitBreakerStatus, SystemCircuitStatus};

use crate::{
    api_types::{ApiResponse, CircuitOverrideBody},
    infra::{
        app_state::AppState,
        errors::{AppError, AppResult},
    },
};

fn breaker(state: &AppState, name: &str) -> AppResult<Arc<CircuitBreaker>> {
    state
        .breakers
        .get(name)
        .ok_or_else(|| AppError::not_found(format!("circuit breaker {name} not found")))
}

pub async fn list_breakers_handler(
    State(state): State<AppState>,
) -> Json<ApiResponse<SystemCircuitStatus>> {
    Json(ApiResponse::success(state.breakers.system_status()))
}

pub async fn get_breaker_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> AppResult<Json<ApiResponse<CircuitBreakerStatus>>> {
    Ok(Json(ApiResponse::success(breaker(&state, &name)?.status())))
}

pub async fn open_breaker_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Option<Json<CircuitOverrideBody>>,
) -> AppResult<Json<ApiResponse<CircuitBreakerStatus>>> {
    let breaker = breaker(&state, &name)?;
    let reason = body
        .and_then(|Json(body)| body.reason)
        .unwrap_or_else(|| "manual override".to_string());
    breaker.force_open(&reason);
    Ok(Json(ApiResponse::success(breaker.status())))
}

pub async fn close_breaker_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Option<Json<CircuitOverrideBody>>,
) -> AppResult<Json<ApiResponse<CircuitBreakerStatus>>> {
    let breaker = breaker(&state, &name)?;
    let reason = body
        .and_then(|Json(body)| body.reason)
        .unwrap_or_else(|| "manual override".to_string());
    breaker.force_close(&reason);
    Ok(Json(ApiResponse::success(breaker.status())))
}
