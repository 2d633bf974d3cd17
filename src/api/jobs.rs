use super::{AppError, AppState};
use crate::{
    jobs::JobInfo,
    metrics,
    models::Role,
    pipeline::PipelineError,
    security::AuthUser,
};
use axum::{
    Json,
    extract::{Extension, Path, State},
    http::StatusCode,
};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Serialize)]
pub struct EnqueueResponse {
    job_id: String,
}

/// Queue the analyze phase and return immediately with a job id.
pub async fn enqueue_analyze(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<EnqueueResponse>), AppError> {
    metrics::inc_requests("/api/jobs/listing/{id}/analyze");
    user.require(Role::Seller)?;
    state
        .store()
        .get_listing(&id)
        .await?
        .filter(|listing| listing.seller_id == user.user_id)
        .ok_or(AppError::NotFound("Listing not found"))?;

    let job_id = state
        .queue
        .enqueue_analysis(&id, &user.user_id)
        .await
        .map_err(|err| PipelineError::internal("enqueue", err.to_string()))?;
    Ok((
        StatusCode::ACCEPTED,
        Json(EnqueueResponse {
            job_id: job_id.to_string(),
        }),
    ))
}

pub async fn status(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<Json<JobInfo>, AppError> {
    let Ok(job_id) = Uuid::parse_str(&id) else {
        return Err(AppError::bad_request("invalid_job_id", "Job id must be a UUID"));
    };
    state
        .queue
        .get(job_id, &user.user_id)
        .await
        .map(Json)
        .ok_or(AppError::NotFound("Job not found"))
}
