use axum::{
    Json,
    extract::{Path, State},
};
use tracing::info;

use hasivu_core::integration::{ComponentReport, SyncOutcome, SyncReport};

use crate::{
    api_types::ApiResponse,
    infra::{
        app_state::AppState,
        errors::{AppError, AppResult},
    },
};

pub async fn list_integrations_handler(
    State(state): State<AppState>,
) -> Json<ApiResponse<Vec<ComponentReport>>> {
    Json(ApiResponse::success(state.integration.components()))
}

pub async fn sync_integration_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> AppResult<Json<ApiResponse<SyncReport>>> {
    let report = state.integration.sync(&name).await?;
    Ok(Json(ApiResponse::success(report)))
}

pub async fn sync_all_handler(
    State(state): State<AppState>,
) -> Json<ApiResponse<Vec<SyncOutcome>>> {
    Json(ApiResponse::success(state.integration.sync_all().await))
}

pub async fn restart_integration_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> AppResult<Json<ApiResponse<ComponentReport>>> {
    state.integration.restart(&name).await?;
    info!(target: "hasivu::integration", component = %name, "component restarted via api");
    let report = state
        .integration
        .components()
        .into_iter()
        .find(|report| report.name == name)
        .ok_or_else(|| AppError::not_found(format!("component {name} not found")))?;
    Ok(Json(ApiResponse::success(report)))
}
