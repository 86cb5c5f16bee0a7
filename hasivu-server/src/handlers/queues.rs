use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use tracing::info;

use hasivu_core::queue::{
    DeadLetterStore, JobHandle, JobId, JobRecord, QueueInstrumentation, QueueName, QueueService,
};

use crate::{
    api_types::{ApiResponse, EnqueueJobBody, PurgeResponse, QueueStatsResponse},
    handlers::parse_path,
    infra::{
        app_state::AppState,
        errors::{AppError, AppResult},
    },
};

pub async fn enqueue_job_handler(
    State(state): State<AppState>,
    Path(queue): Path<String>,
    Json(body): Json<EnqueueJobBody>,
) -> AppResult<(StatusCode, Json<ApiResponse<JobHandle>>)> {
    let queue: QueueName = parse_path(&queue, "queue name")?;
    let handle = state.queue.enqueue(body.into_request(queue)).await?;
    let status = if handle.accepted {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(ApiResponse::success(handle))))
}

pub async fn queue_stats_handler(
    State(state): State<AppState>,
) -> AppResult<Json<ApiResponse<QueueStatsResponse>>> {
    let snapshot = state.queue.queue_snapshot().await?;
    let total_dead_letters = snapshot.total_dead_letters();
    let running_queues = state.workers.running_queues().await;
    let school_load = state.workers.school_load().await;
    Ok(Json(ApiResponse::success(QueueStatsResponse {
        snapshot,
        total_dead_letters,
        running_queues,
        school_load,
    })))
}

pub async fn get_job_handler(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> AppResult<Json<ApiResponse<JobRecord>>> {
    let job_id: JobId = parse_path(&job_id, "job id")?;
    let record = state
        .queue
        .job(job_id)
        .ok_or_else(|| AppError::not_found(format!("job {job_id} not found")))?;
    Ok(Json(ApiResponse::success(record)))
}

pub async fn cancel_job_handler(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> AppResult<StatusCode> {
    let job_id: JobId = parse_path(&job_id, "job id")?;
    state.queue.cancel_job(job_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_dead_letters_handler(
    State(state): State<AppState>,
    Path(queue): Path<String>,
) -> AppResult<Json<ApiResponse<Vec<JobRecord>>>> {
    let queue: QueueName = parse_path(&queue, "queue name")?;
    let records = state.queue.dead_letters(&queue).await?;
    Ok(Json(ApiResponse::success(records)))
}

pub async fn replay_dead_letter_handler(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> AppResult<(StatusCode, Json<ApiResponse<JobHandle>>)> {
    let job_id: JobId = parse_path(&job_id, "job id")?;
    let handle = state.queue.replay_dead_letter(job_id).await?;
    info!(target: "hasivu::queue", %job_id, "dead letter replayed via api");
    Ok((StatusCode::ACCEPTED, Json(ApiResponse::success(handle))))
}

pub async fn purge_dead_letters_handler(
    State(state): State<AppState>,
    Path(queue): Path<String>,
) -> AppResult<Json<ApiResponse<PurgeResponse>>> {
    let queue: QueueName = parse_path(&queue, "queue name")?;
    let purged = state.queue.purge_dead_letters(&queue).await?;
    info!(target: "hasivu::queue", %queue, purged, "dead letters purged via api");
    Ok(Json(ApiResponse::success(PurgeResponse { queue, purged })))
}
