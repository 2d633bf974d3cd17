use super::{AppError, AppState, json_body};
use crate::{
    metrics,
    models::{BidResponse, Role},
    security::AuthUser,
};
use axum::{
    Json,
    extract::{Extension, Path, State, rejection::JsonRejection},
};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct BidRequest {
    amount: f64,
}

/// Place a sealed bid. The response carries the distinct-bidder count only.
pub async fn place(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
    payload: Result<Json<BidRequest>, JsonRejection>,
) -> Result<Json<BidResponse>, AppError> {
    metrics::inc_requests("/api/listing/{id}/bid");
    user.require(Role::Buyer)?;
    let req = json_body(payload, "invalid_amount")?;
    Ok(Json(
        state
            .pipeline
            .place_bid(&id, &user.user_id, req.amount)
            .await?,
    ))
}
