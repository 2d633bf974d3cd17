use super::{AppError, AppState, json_body};
use crate::{
    metrics,
    models::{Role, TokenResponse, User, UserResponse},
    security::{AuthError, AuthUser, hash_password, verify_password},
    store::StoreError,
};
use axum::{
    Json,
    extract::{Extension, State, rejection::JsonRejection},
};
use chrono::Utc;
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    email: String,
    password: String,
    role: Role,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    email: String,
    password: String,
}

/// Create an account and return a token for it.
///
/// - Method: `POST`
/// - Path: `/api/auth/register`
/// - Auth: none
/// - Errors: 400 on a malformed body or when the email is already registered
pub async fn register(
    State(state): State<AppState>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<Json<TokenResponse>, AppError> {
    metrics::inc_requests("/api/auth/register");
    let req = json_body(payload, "invalid_request")?;
    let email = normalize_email(&req.email);
    if !email.contains('@') || req.password.is_empty() {
        return Err(AppError::bad_request(
            "invalid_registration",
            "A valid email and a non-empty password are required",
        ));
    }

    let password = req.password;
    let password_hash = tokio::task::spawn_blocking(move || hash_password(&password))
        .await
        .map_err(|err| AuthError::Hash(err.to_string()))??;
    let user = User {
        user_id: Uuid::new_v4().to_string(),
        email,
        password_hash,
        role: req.role,
        name: req.name.trim().to_string(),
        created_at: Utc::now(),
    };
    match state.store().create_user(user.clone()).await {
        Ok(()) => {}
        Err(StoreError::Duplicate(_)) => {
            return Err(AppError::bad_request(
                "email_taken",
                "This email is already registered",
            ));
        }
        Err(err) => return Err(err.into()),
    }

    info!(
        target = "auction.auth",
        user_id = %user.user_id,
        role = user.role.as_str(),
        "user registered"
    );
    token_response(&state, &user)
}

/// Exchange credentials for a token.
///
/// - Method: `POST`
/// - Path: `/api/auth/login`
/// - Errors: 401 on unknown email or wrong password
pub async fn login(
    State(state): State<AppState>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<TokenResponse>, AppError> {
    metrics::inc_requests("/api/auth/login");
    let req = json_body(payload, "invalid_request")?;
    let user = state
        .store()
        .find_user_by_email(&normalize_email(&req.email))
        .await?
        .ok_or(AuthError::InvalidCredentials)?;

    let password = req.password;
    let stored = user.password_hash.clone();
    let valid = tokio::task::spawn_blocking(move || verify_password(&password, &stored))
        .await
        .unwrap_or(false);
    if !valid {
        info!(target = "auction.auth", user_id = %user.user_id, "login refused");
        return Err(AuthError::InvalidCredentials.into());
    }
    token_response(&state, &user)
}

pub async fn me(Extension(user): Extension<AuthUser>) -> Json<UserResponse> {
    metrics::inc_requests("/api/auth/me");
    Json(UserResponse {
        user_id: user.user_id,
        email: user.email,
        role: user.role,
        name: user.name,
    })
}

fn token_response(state: &AppState, user: &User) -> Result<Json<TokenResponse>, AppError> {
    Ok(Json(TokenResponse {
        access_token: state.jwt.issue(&user.user_id)?,
        token_type: "bearer",
        user: UserResponse::from(user),
    }))
}

fn normalize_email(raw: &str) -> String {
    raw.trim().to_lowercase()
}
