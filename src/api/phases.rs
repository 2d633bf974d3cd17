//! Seller-only phase endpoints. Each one advances a listing by exactly one
//! phase; calls out of order answer 409.

use super::{AppError, AppState};
use crate::{
    metrics,
    models::{PhaseResponse, Role},
    security::AuthUser,
};
use axum::{
    Json,
    extract::{Extension, Path, State},
};

/// Phase 1 -> 2: authenticity analysis.
pub async fn analyze(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<Json<PhaseResponse>, AppError> {
    metrics::inc_requests("/api/listing/{id}/analyze");
    user.require(Role::Seller)?;
    Ok(Json(state.pipeline.analyze(&id, &user.user_id).await?))
}

/// Phase 2 -> 3: price estimation.
pub async fn estimate(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<Json<PhaseResponse>, AppError> {
    metrics::inc_requests("/api/listing/{id}/estimate");
    user.require(Role::Seller)?;
    Ok(Json(state.pipeline.estimate(&id, &user.user_id).await?))
}

/// Phase 3 -> 4: marketing post.
pub async fn generate(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<Json<PhaseResponse>, AppError> {
    metrics::inc_requests("/api/listing/{id}/generate");
    user.require(Role::Seller)?;
    Ok(Json(state.pipeline.generate(&id, &user.user_id).await?))
}

/// Phase 4 -> 5: opens bidding.
pub async fn deploy(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<Json<PhaseResponse>, AppError> {
    metrics::inc_requests("/api/listing/{id}/deploy");
    user.require(Role::Seller)?;
    Ok(Json(state.pipeline.deploy(&id, &user.user_id).await?))
}
