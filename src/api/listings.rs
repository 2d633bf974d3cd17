use super::{AppError, AppState};
use crate::{
    metrics,
    models::{Listing, ListingBuyerView, Role},
    security::AuthUser,
};
use axum::{
    Json,
    extract::{Extension, Path, State},
    response::{IntoResponse, Response},
};

/// Buyers see active auctions through the redacted view; sellers see their
/// own listings, newest first.
pub async fn list(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<Response, AppError> {
    metrics::inc_requests("/api/listings");
    match user.role {
        Role::Buyer => {
            let listings = state.store().list_active().await?;
            let views: Vec<ListingBuyerView> = listings.iter().map(Listing::buyer_view).collect();
            Ok(Json(views).into_response())
        }
        Role::Seller => Ok(Json(seller_listings(&state, &user).await?).into_response()),
    }
}

pub async fn mine(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<Vec<Listing>>, AppError> {
    metrics::inc_requests("/api/listings/me");
    user.require(Role::Seller)?;
    Ok(Json(seller_listings(&state, &user).await?))
}

/// Served under both `/api/listings/{id}` and `/api/listing/{id}`.
pub async fn get_one(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    metrics::inc_requests("/api/listings/{id}");
    let listing = state
        .store()
        .get_listing(&id)
        .await?
        .ok_or(AppError::NotFound("Listing not found"))?;
    Ok(match user.role {
        Role::Buyer => Json(listing.buyer_view()).into_response(),
        Role::Seller => Json(listing.without_payloads()).into_response(),
    })
}

async fn seller_listings(state: &AppState, user: &AuthUser) -> Result<Vec<Listing>, AppError> {
    Ok(state
        .store()
        .list_by_seller(&user.user_id)
        .await?
        .into_iter()
        .map(Listing::without_payloads)
        .collect())
}
