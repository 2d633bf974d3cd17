//! HTTP surface: auth, listings, the seller pipeline, sealed bids, async
//! jobs and the ambient routes.

mod auth;
mod bids;
mod docs;
mod jobs;
mod listings;
mod phases;
mod uploads;

use crate::{
    idempotency::IdempotencyCache,
    jobs::JobQueue,
    models::ApiError,
    pipeline::{Pipeline, PipelineError, PipelineErrorKind},
    security::{AuthError, AuthState, JwtConfig, TokenBuckets, require_auth},
    store::{SharedStore, StoreError},
    upload::{UploadError, UploadSettings},
};
use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, rejection::JsonRejection},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
    trace::TraceLayer,
};
use tracing::error;

pub use docs::load_openapi;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Pipeline,
    pub queue: JobQueue,
    pub jwt: Arc<JwtConfig>,
    pub uploads: Arc<UploadSettings>,
    pub idempotency: Arc<IdempotencyCache>,
    pub openapi: Arc<Value>,
    pub prometheus: PrometheusHandle,
    pub body_limit: usize,
}

impl AppState {
    pub fn store(&self) -> &SharedStore {
        self.pipeline.store()
    }
}

pub fn router(state: AppState, limiter: TokenBuckets) -> Router {
    let auth_state = AuthState::new(state.store().clone(), state.jwt.clone(), limiter);

    let protected = Router::new()
        .route("/auth/me", get(auth::me))
        .route("/listings", get(listings::list))
        .route("/listings/me", get(listings::mine))
        .route("/listings/{id}", get(listings::get_one))
        .route("/listing/{id}", get(listings::get_one))
        .route("/upload", post(uploads::upload))
        .route("/listing/{id}/analyze", post(phases::analyze))
        .route("/listing/{id}/estimate", post(phases::estimate))
        .route("/listing/{id}/generate", post(phases::generate))
        .route("/listing/{id}/deploy", post(phases::deploy))
        .route("/listing/{id}/bid", post(bids::place))
        .nest(
            "/jobs",
            Router::new()
                .route("/listing/{id}/analyze", post(jobs::enqueue_analyze))
                .route("/{id}", get(jobs::status)),
        )
        .route_layer(middleware::from_fn_with_state(auth_state, require_auth));

    let api = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .merge(protected);

    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);
    let body_limit = state.body_limit;
    let uploads_dir = state.uploads.dir.clone();

    Router::new()
        .route("/health", get(docs::health))
        .route("/metrics", get(docs::metrics))
        .route("/openapi.json", get(docs::openapi_json))
        .route("/docs", get(docs::swagger_ui))
        .nest("/api", api)
        .nest_service("/uploads", ServeDir::new(uploads_dir))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors)
                .layer(DefaultBodyLimit::max(body_limit)),
        )
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{detail}")]
    BadRequest { code: &'static str, detail: String },
    #[error("{0}")]
    NotFound(&'static str),
}

impl AppError {
    pub fn bad_request(code: &'static str, detail: impl Into<String>) -> Self {
        Self::BadRequest {
            code,
            detail: detail.into(),
        }
    }
}

/// Unwraps a JSON body, turning axum's rejection into a 400 under `code`.
pub(crate) fn json_body<T>(
    payload: Result<Json<T>, JsonRejection>,
    code: &'static str,
) -> Result<T, AppError> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| AppError::bad_request(code, rejection.body_text()))
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, detail) = match self {
            AppError::Auth(err) => return err.into_response(),
            AppError::Pipeline(err) => {
                let status = match err.kind() {
                    PipelineErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
                    PipelineErrorKind::NotFound => StatusCode::NOT_FOUND,
                    PipelineErrorKind::Conflict => StatusCode::CONFLICT,
                    PipelineErrorKind::Internal => {
                        error!(target = "auction.api", error = %err, "pipeline failure");
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                (status, err.stage().to_string(), err.detail().to_string())
            }
            AppError::Upload(err) if err.is_rejection() => (
                StatusCode::BAD_REQUEST,
                "invalid_image".to_string(),
                err.to_string(),
            ),
            AppError::Upload(err) => {
                error!(target = "auction.api", error = %err, "upload failure");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "upload_failed".to_string(),
                    "Failed to store the uploaded images".to_string(),
                )
            }
            AppError::Store(err) => {
                error!(target = "auction.api", error = %err, "store failure");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "store_unavailable".to_string(),
                    "Database operation failed".to_string(),
                )
            }
            AppError::BadRequest { code, detail } => {
                (StatusCode::BAD_REQUEST, code.to_string(), detail)
            }
            AppError::NotFound(what) => (
                StatusCode::NOT_FOUND,
                "not_found".to_string(),
                what.to_string(),
            ),
        };
        let payload = ApiError {
            error: code,
            detail: Some(detail),
        };
        (status, Json(payload)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imaging::tests::{detailed_rgb, encode};
    use crate::pipeline::tests::offline_pipeline;
    use crate::store::MemoryStore;
    use axum::{
        body::Body,
        http::{Request, header},
    };
    use http_body_util::BodyExt;
    use image::{ImageFormat, Rgb, RgbImage};
    use metrics_exporter_prometheus::PrometheusBuilder;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct Harness {
        app: Router,
        _dir: TempDir,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        let store: SharedStore = Arc::new(MemoryStore::default());
        let pipeline = offline_pipeline(store);
        let (queue, _worker) = JobQueue::spawn(pipeline.clone());
        let state = AppState {
            pipeline,
            queue,
            jwt: Arc::new(JwtConfig::from_secret(b"router-test-secret")),
            uploads: Arc::new(UploadSettings::with_dir(dir.path())),
            idempotency: Arc::new(IdempotencyCache::in_memory()),
            openapi: Arc::new(load_openapi()),
            prometheus: PrometheusBuilder::new().build_recorder().handle(),
            body_limit: 32 * 1024 * 1024,
        };
        Harness {
            app: router(state, TokenBuckets::new(1000.0, 1000.0)),
            _dir: dir,
        }
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    fn json_request(method: &str, uri: &str, token: Option<&str>, body: Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        builder
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    fn get(uri: &str, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        builder.body(Body::empty()).expect("request")
    }

    fn post(uri: &str, token: &str) -> Request<Body> {
        json_request("POST", uri, Some(token), json!({}))
    }

    async fn register(app: &Router, email: &str, role: &str) -> String {
        let (status, body) = send(
            app,
            json_request(
                "POST",
                "/api/auth/register",
                None,
                json!({"email": email, "password": "hunter22", "role": role, "name": "Test"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        body["access_token"].as_str().expect("token").to_string()
    }

    fn upload_request(token: &str, files: &[Vec<u8>], key: Option<&str>) -> Request<Body> {
        upload_request_with(token, files, &[], key)
    }

    fn upload_request_with(
        token: &str,
        files: &[Vec<u8>],
        documents: &[(&str, &[u8])],
        key: Option<&str>,
    ) -> Request<Body> {
        let boundary = "auction-test-boundary";
        let mut body = Vec::new();
        for (name, value) in [("title", "Bronze figure"), ("category", "sculpture")] {
            body.extend_from_slice(
                format!(
                    "--{boundary}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
                )
                .as_bytes(),
            );
        }
        for (index, bytes) in files.iter().enumerate() {
            body.extend_from_slice(
                format!(
                    "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"item{index}.png\"\r\nContent-Type: image/png\r\n\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(bytes);
            body.extend_from_slice(b"\r\n");
        }
        for (filename, bytes) in documents {
            body.extend_from_slice(
                format!(
                    "--{boundary}\r\nContent-Disposition: form-data; name=\"documents\"; filename=\"{filename}\"\r\nContent-Type: application/pdf\r\n\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(bytes);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());

        let mut builder = Request::builder()
            .method("POST")
            .uri("/api/upload")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={boundary}"),
            )
            .header(header::AUTHORIZATION, format!("Bearer {token}"));
        if let Some(key) = key {
            builder = builder.header("Idempotency-Key", key);
        }
        builder.body(Body::from(body)).expect("request")
    }

    fn sharp_png() -> Vec<u8> {
        encode(&detailed_rgb(1000, 1000, 0), ImageFormat::Png)
    }

    async fn upload_listing(app: &Router, token: &str) -> String {
        let (status, body) = send(app, upload_request(token, &[sharp_png()], None)).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        body["listing_id"].as_str().expect("listing id").to_string()
    }

    #[tokio::test]
    async fn register_login_and_me() {
        let h = harness();
        let token = register(&h.app, "Seller@Example.com", "seller").await;

        let (status, body) = send(
            &h.app,
            json_request(
                "POST",
                "/api/auth/register",
                None,
                json!({"email": "seller@example.com", "password": "x", "role": "buyer"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "email_taken");

        let (status, body) = send(
            &h.app,
            json_request(
                "POST",
                "/api/auth/register",
                None,
                json!({"email": "x@example.com", "password": "x", "role": "admin"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_request");

        let (status, body) = send(
            &h.app,
            json_request("POST", "/api/auth/login", None, json!({"email": "x@example.com"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_request");

        let (status, _) = send(
            &h.app,
            json_request(
                "POST",
                "/api/auth/login",
                None,
                json!({"email": "seller@example.com", "password": "wrong"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, body) = send(
            &h.app,
            json_request(
                "POST",
                "/api/auth/login",
                None,
                json!({"email": "seller@example.com", "password": "hunter22"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["token_type"], "bearer");
        assert_eq!(body["user"]["role"], "seller");

        let (status, body) = send(&h.app, get("/api/auth/me", Some(&token))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["email"], "seller@example.com");
        assert!(body.get("password_hash").is_none());
    }

    #[tokio::test]
    async fn missing_token_and_wrong_role() {
        let h = harness();
        let response = h
            .app
            .clone()
            .oneshot(get("/api/listings", None))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));

        let (status, _) = send(&h.app, get("/api/listings", Some("not-a-jwt"))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let buyer = register(&h.app, "buyer@example.com", "buyer").await;
        let (status, body) = send(&h.app, get("/api/listings/me", Some(&buyer))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "forbidden");
        let (status, _) = send(&h.app, post("/api/listing/any/analyze", &buyer)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let response = h
            .app
            .clone()
            .oneshot(get("/api/auth/me", Some(&buyer)))
            .await
            .expect("response");
        assert!(response.headers().contains_key("x-ratelimit-remaining"));
    }

    #[tokio::test]
    async fn upload_rejects_small_and_blurry_images() {
        let h = harness();
        let seller = register(&h.app, "s@example.com", "seller").await;

        let small = encode(&detailed_rgb(400, 400, 0), ImageFormat::Png);
        let (status, body) = send(&h.app, upload_request(&seller, &[small], None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_image");

        let blurry = encode(
            &RgbImage::from_pixel(1000, 1000, Rgb([90, 90, 90])),
            ImageFormat::Png,
        );
        let (status, body) = send(&h.app, upload_request(&seller, &[blurry], None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["detail"].as_str().expect("detail").contains("blurry"));

        let (status, _) = send(&h.app, upload_request(&seller, &[], None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn seller_pipeline_then_sealed_bids() {
        let h = harness();
        let seller = register(&h.app, "seller@example.com", "seller").await;
        let buyer = register(&h.app, "buyer@example.com", "buyer").await;
        let other_buyer = register(&h.app, "buyer2@example.com", "buyer").await;

        let (status, first) =
            send(&h.app, upload_request(&seller, &[sharp_png()], Some("upload-1"))).await;
        assert_eq!(status, StatusCode::OK, "{first}");
        assert_eq!(first["images"], 1);
        let (_, replay) =
            send(&h.app, upload_request(&seller, &[sharp_png()], Some("upload-1"))).await;
        assert_eq!(replay["listing_id"], first["listing_id"]);
        let id = first["listing_id"].as_str().expect("listing id").to_string();

        let (status, _) = send(&h.app, post(&format!("/api/listing/{id}/estimate"), &seller)).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) = send(&h.app, post(&format!("/api/listing/{id}/analyze"), &seller)).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["phase"], 2);
        assert_eq!(body["result"]["verdict"], "validated");

        for (step, phase) in [("estimate", 3), ("generate", 4), ("deploy", 5)] {
            let (status, body) =
                send(&h.app, post(&format!("/api/listing/{id}/{step}"), &seller)).await;
            assert_eq!(status, StatusCode::OK, "{step}: {body}");
            assert_eq!(body["phase"], phase);
        }

        let (status, listings) = send(&h.app, get("/api/listings", Some(&buyer))).await;
        assert_eq!(status, StatusCode::OK);
        let listing = &listings.as_array().expect("array")[0];
        assert_eq!(listing["status"], "AUCTION_ACTIVE");
        for hidden in [
            "seller_id",
            "ai_analysis",
            "price_estimation",
            "generated_post",
            "blockchain",
            "pipeline_phase",
            "stage_reports",
        ] {
            assert!(listing.get(hidden).is_none(), "{hidden} leaked");
        }

        let bid = |token: &str, amount: f64| {
            json_request(
                "POST",
                &format!("/api/listing/{id}/bid"),
                Some(token),
                json!({ "amount": amount }),
            )
        };
        let (status, _) = send(&h.app, bid(&buyer, 10.0)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, body) = send(
            &h.app,
            json_request(
                "POST",
                &format!("/api/listing/{id}/bid"),
                Some(&buyer),
                json!({ "amount": "abc" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_amount");
        assert!(body["detail"].is_string());
        let (status, _) = send(&h.app, bid(&seller, 100.0)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (_, body) = send(&h.app, bid(&buyer, 75.0)).await;
        assert_eq!(body["participants"], 1);
        let (_, body) = send(&h.app, bid(&buyer, 120.0)).await;
        assert_eq!(body["participants"], 1);
        assert!(body.get("amount").is_none());
        let (_, body) = send(&h.app, bid(&other_buyer, 90.0)).await;
        assert_eq!(body["participants"], 2);

        let (status, full) = send(&h.app, get(&format!("/api/listing/{id}"), Some(&seller))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(full["participants_count"], 2);
        assert!(full.get("ai_analysis").is_some());
        assert!(full["images"][0].get("inline_data").is_none());

        let (status, _) = send(&h.app, get("/api/listings/missing", Some(&buyer))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn foreign_listing_is_not_found() {
        let h = harness();
        let seller = register(&h.app, "a@example.com", "seller").await;
        let other = register(&h.app, "b@example.com", "seller").await;
        let id = upload_listing(&h.app, &seller).await;

        let (status, _) = send(&h.app, post(&format!("/api/listing/{id}/analyze"), &other)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, mine) = send(&h.app, get("/api/listings/me", Some(&other))).await;
        assert_eq!(mine, json!([]));
        let (_, mine) = send(&h.app, get("/api/listings", Some(&seller))).await;
        assert_eq!(mine.as_array().map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn supporting_documents_stay_with_the_listing() {
        let h = harness();
        let seller = register(&h.app, "docs@example.com", "seller").await;
        let certificate: &[u8] = b"%PDF-1.4 certificate of authenticity";

        let (status, body) = send(
            &h.app,
            upload_request_with(
                &seller,
                &[sharp_png()],
                &[("certificate.pdf", certificate), ("empty.pdf", &b""[..])],
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["documents"], 1);
        let id = body["listing_id"].as_str().expect("listing id").to_string();

        let (status, listing) = send(&h.app, get(&format!("/api/listing/{id}"), Some(&seller))).await;
        assert_eq!(status, StatusCode::OK);
        let documents = listing["documents"].as_array().expect("documents");
        assert_eq!(documents.len(), 1);
        assert_eq!(documents[0]["filename"], format!("{id}_doc_0.pdf"));
        assert_eq!(documents[0]["original_name"], "certificate.pdf");
        let path = documents[0]["local_path"].as_str().expect("path");
        assert_eq!(std::fs::read(path).expect("stored document"), certificate);
    }

    #[tokio::test]
    async fn analyze_runs_as_a_job() {
        let h = harness();
        let seller = register(&h.app, "s@example.com", "seller").await;
        let id = upload_listing(&h.app, &seller).await;

        let (status, body) =
            send(&h.app, post(&format!("/api/jobs/listing/{id}/analyze"), &seller)).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let job_id = body["job_id"].as_str().expect("job id").to_string();

        let mut state = Value::Null;
        for _ in 0..400 {
            let (status, body) = send(&h.app, get(&format!("/api/jobs/{job_id}"), Some(&seller))).await;
            assert_eq!(status, StatusCode::OK);
            if body["state"] == "completed" || body["state"] == "failed" {
                state = body;
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert_eq!(state["state"], "completed", "{state}");
        assert_eq!(state["result"]["phase"], 2);

        let (status, _) = send(&h.app, get("/api/jobs/not-a-uuid", Some(&seller))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn ambient_routes() {
        let h = harness();
        let (status, body) = send(&h.app, get("/health", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["store"], "memory");

        let (status, body) = send(&h.app, get("/openapi.json", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["paths"].get("/api/upload").is_some());

        let response = h.app.clone().oneshot(get("/docs", None)).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }
}
