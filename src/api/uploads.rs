use super::{AppError, AppState};
use crate::{
    idempotency::IdempotencyCache,
    metrics,
    models::{Listing, ListingDetails, Role, UploadResponse},
    security::AuthUser,
    upload::{self, IncomingFile},
};
use axum::{
    Json,
    extract::{Extension, Multipart, State, multipart::MultipartError},
    http::HeaderMap,
};
use tracing::{info, warn};
use uuid::Uuid;

/// Create a draft listing from one or more photos.
///
/// - Method: `POST`
/// - Path: `/api/upload`
/// - Auth: seller
/// - Body: multipart, repeated `file` parts, optional repeated `documents`
///   parts (stored as uploaded), plus optional `title`, `category` and
///   `description`
/// - Headers: optional `Idempotency-Key`; a repeated key replays the first
///   response without creating another listing
pub async fn upload(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    metrics::inc_requests("/api/upload");
    user.require(Role::Seller)?;

    let idempotency_key = headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|key| IdempotencyCache::scoped_key(&user.user_id, key));
    if let Some(key) = &idempotency_key
        && let Some(existing) = state.idempotency.get::<UploadResponse>(key).await
    {
        info!(target = "auction.upload", listing_id = %existing.listing_id, "idempotent replay");
        return Ok(Json(existing));
    }

    let mut files = Vec::new();
    let mut documents = Vec::new();
    let mut details = ListingDetails::default();
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" | "files" => {
                let original_name = field.file_name().unwrap_or("upload").to_string();
                let bytes = field.bytes().await.map_err(multipart_error)?;
                files.push(IncomingFile {
                    original_name,
                    bytes: bytes.to_vec(),
                });
            }
            "documents" | "document" => {
                let original_name = field.file_name().unwrap_or("document").to_string();
                let bytes = field.bytes().await.map_err(multipart_error)?;
                // Browsers send an empty part when no file was chosen.
                if !bytes.is_empty() {
                    documents.push(IncomingFile {
                        original_name,
                        bytes: bytes.to_vec(),
                    });
                }
            }
            "title" => details.title = text_field(field.text().await.map_err(multipart_error)?),
            "category" => {
                details.category = text_field(field.text().await.map_err(multipart_error)?)
            }
            "description" => {
                details.description = text_field(field.text().await.map_err(multipart_error)?)
            }
            other => warn!(target = "auction.upload", field = other, "ignoring form field"),
        }
    }

    let listing_id = Uuid::new_v4().to_string();
    let images = upload::store_images(&state.uploads, &listing_id, files).await?;
    let documents = match upload::store_documents(&state.uploads, &listing_id, documents).await {
        Ok(documents) => documents,
        Err(err) => {
            upload::remove_files(&images).await;
            return Err(err.into());
        }
    };
    let count = images.len();
    let document_count = documents.len();
    let mut listing =
        Listing::draft(listing_id.clone(), user.user_id.clone(), images.clone(), details);
    listing.documents = documents.clone();
    if let Err(err) = state.store().insert_listing(listing).await {
        upload::remove_files(&images).await;
        upload::remove_documents(&documents).await;
        return Err(err.into());
    }

    let response = UploadResponse {
        listing_id,
        message: "Draft listing created successfully".into(),
        images: count,
        documents: document_count,
    };
    if let Some(key) = &idempotency_key {
        state.idempotency.set(key, &response).await;
    }
    metrics::images_uploaded(count);
    info!(
        target = "auction.upload",
        listing_id = %response.listing_id,
        seller_id = %user.user_id,
        images = count,
        documents = document_count,
        "draft listing created"
    );
    Ok(Json(response))
}

fn text_field(value: String) -> Option<String> {
    Some(value.trim().to_string()).filter(|v| !v.is_empty())
}

fn multipart_error(err: MultipartError) -> AppError {
    AppError::bad_request("invalid_multipart", err.body_text())
}
