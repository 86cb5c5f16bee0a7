use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use hasivu_core::monitoring::{DetectionStats, PerformanceReport, ReportRequest};

use crate::{
    api_types::{ApiResponse, BaselineRequest, DetectRequest, DetectResponse, FeedbackRequest},
    handlers::parse_path,
    infra::{
        app_state::AppState,
        errors::{AppError, AppResult},
    },
};

pub async fn detect_anomalies_handler(
    State(state): State<AppState>,
    Json(request): Json<DetectRequest>,
) -> AppResult<Json<ApiResponse<DetectResponse>>> {
    if request.samples.is_empty() {
        return Err(AppError::bad_request("samples must not be empty"));
    }
    let alerts = state.detector.detect(&request.samples);
    debug!(
        target: "hasivu::monitoring",
        samples = request.samples.len(),
        alerts = alerts.len(),
        "anomaly detection requested"
    );
    Ok(Json(ApiResponse::success(DetectResponse {
        alerts,
        statistics: state.detector.statistics(),
    })))
}

pub async fn anomaly_feedback_handler(
    State(state): State<AppState>,
    Path(alert_id): Path<String>,
    Json(request): Json<FeedbackRequest>,
) -> AppResult<Json<ApiResponse<DetectionStats>>> {
    let alert_id: Uuid = parse_path(&alert_id, "alert id")?;
    state
        .detector
        .record_feedback(alert_id, request.false_positive)?;
    Ok(Json(ApiResponse::success(state.detector.statistics())))
}

pub async fn register_baseline_handler(
    State(state): State<AppState>,
    Json(request): Json<BaselineRequest>,
) -> AppResult<(StatusCode, Json<ApiResponse<BaselineRequest>>)> {
    if request.baseline.std < 0.0 || !request.baseline.std.is_finite() {
        return Err(AppError::bad_request("baseline std must be a non-negative number"));
    }
    state.detector.register_baseline(
        request.service.clone(),
        request.metric.clone(),
        request.baseline.clone(),
    );
    Ok((StatusCode::CREATED, Json(ApiResponse::success(request))))
}

pub async fn performance_report_handler(
    State(state): State<AppState>,
    Json(request): Json<ReportRequest>,
) -> Json<ApiResponse<PerformanceReport>> {
    Json(ApiResponse::success(
        state.analytics.report(&request, Utc::now()),
    ))
}
