use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::info;

use hasivu_core::{
    pipeline::{Checkpoint, PipelineDefinition, PipelineRun, PipelineSummary},
    types::{PipelineId, RunId},
};

use crate::{
    api_types::{ApiResponse, RunAccepted, TriggerQuery},
    handlers::parse_path,
    infra::{
        app_state::AppState,
        errors::{AppError, AppResult},
    },
};

pub async fn list_pipelines_handler(
    State(state): State<AppState>,
) -> Json<ApiResponse<Vec<PipelineSummary>>> {
    Json(ApiResponse::success(state.pipelines.list()))
}

pub async fn create_pipeline_handler(
    State(state): State<AppState>,
    Json(definition): Json<PipelineDefinition>,
) -> AppResult<(StatusCode, Json<ApiResponse<PipelineDefinition>>)> {
    state.pipelines.register(definition.clone())?;
    info!(target: "hasivu::pipeline", pipeline_id = %definition.id, "pipeline registered via api");
    Ok((StatusCode::CREATED, Json(ApiResponse::success(definition))))
}

pub async fn get_pipeline_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<ApiResponse<PipelineSummary>>> {
    let id = PipelineId::new(id);
    let summary = state
        .pipelines
        .list()
        .into_iter()
        .find(|summary| summary.definition.id == id)
        .ok_or_else(|| AppError::not_found(format!("pipeline {id} not found")))?;
    Ok(Json(ApiResponse::success(summary)))
}

pub async fn delete_pipeline_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<ApiResponse<PipelineDefinition>>> {
    let removed = state.pipelines.unregister(&PipelineId::new(id)).await?;
    Ok(Json(ApiResponse::success(removed)))
}

/// Starts a run in the background (202 with its id), or inline with
/// `?wait=true` (200 with the finished run).
pub async fn trigger_run_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<TriggerQuery>,
) -> AppResult<Response> {
    let id = PipelineId::new(id);
    if query.wait {
        let run = state.pipelines.run(&id).await?;
        return Ok(Json(ApiResponse::success(run)).into_response());
    }
    let run_id = state.pipelines.trigger(&id)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(ApiResponse::success(RunAccepted { run_id })),
    )
        .into_response())
}

pub async fn list_runs_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<ApiResponse<Vec<PipelineRun>>>> {
    let runs = state.pipelines.runs(&PipelineId::new(id))?;
    Ok(Json(ApiResponse::success(runs)))
}

pub async fn checkpoint_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<ApiResponse<Checkpoint>>> {
    let id = PipelineId::new(id);
    let checkpoint = state
        .pipelines
        .checkpoint(&id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("no checkpoint stored for {id}")))?;
    Ok(Json(ApiResponse::success(checkpoint)))
}

pub async fn active_runs_handler(
    State(state): State<AppState>,
) -> Json<ApiResponse<Vec<PipelineRun>>> {
    Json(ApiResponse::success(state.pipelines.active_runs()))
}

pub async fn get_run_handler(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> AppResult<Json<ApiResponse<PipelineRun>>> {
    let run_id: RunId = parse_path(&run_id, "run id")?;
    let run = state
        .pipelines
        .run_status(run_id)
        .ok_or_else(|| AppError::not_found(format!("run {run_id} not found")))?;
    Ok(Json(ApiResponse::success(run)))
}

pub async fn cancel_run_handler(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> AppResult<(StatusCode, Json<ApiResponse<RunAccepted>>)> {
    let run_id: RunId = parse_path(&run_id, "run id")?;
    state.pipelines.cancel(run_id)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(ApiResponse::success(RunAccepted { run_id })
            .with_message("cancellation requested")),
    ))
}
