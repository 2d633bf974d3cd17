use crate::config::{env_parse, env_string};
use crate::models::{ApiError, Role, User};
use crate::store::{SharedStore, StoreError};
use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier, password_hash::SaltString,
};
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{self, Request, StatusCode, header::HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    convert::Infallible,
    sync::Arc,
    time::{Duration as StdDuration, Instant},
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, warn};

const TOKEN_TTL_DAYS: i64 = 7;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,
    #[error("invalid or expired token")]
    InvalidToken,
    #[error("user not found")]
    UnknownUser,
    #[error("incorrect email or password")]
    InvalidCredentials,
    #[error("reserved for {0}s")]
    Forbidden(&'static str),
    #[error("password hashing failed: {0}")]
    Hash(String),
    #[error("user lookup failed")]
    Store(#[source] StoreError),
}

impl AuthError {
    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::MissingToken
            | AuthError::InvalidToken
            | AuthError::UnknownUser
            | AuthError::InvalidCredentials => StatusCode::UNAUTHORIZED,
            AuthError::Forbidden(_) => StatusCode::FORBIDDEN,
            AuthError::Hash(_) | AuthError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AuthError::MissingToken => "missing_token",
            AuthError::InvalidToken => "invalid_token",
            AuthError::UnknownUser => "unknown_user",
            AuthError::InvalidCredentials => "invalid_credentials",
            AuthError::Forbidden(_) => "forbidden",
            AuthError::Hash(_) => "auth_internal",
            AuthError::Store(_) => "store_unavailable",
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status();
        let payload = ApiError {
            error: self.code().to_string(),
            detail: Some(self.to_string()),
        };
        let mut response = (status, Json(payload)).into_response();
        if status == StatusCode::UNAUTHORIZED {
            response
                .headers_mut()
                .insert(http::header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }
        response
    }
}

/// Argon2id PHC string for `password`.
pub fn hash_password(password: &str) -> Result<String, AuthError> {
    let salt = SaltString::encode_b64(&rand::random::<[u8; 16]>())
        .map_err(|err| AuthError::Hash(err.to_string()))?;
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| AuthError::Hash(err.to_string()))
}

pub fn verify_password(password: &str, stored: &str) -> bool {
    PasswordHash::new(stored)
        .map(|parsed| {
            Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok()
        })
        .unwrap_or(false)
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    iat: usize,
    exp: usize,
}

/// HS256 signing keys for access tokens.
#[derive(Clone)]
pub struct JwtConfig {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl JwtConfig {
    pub fn from_secret(secret: &[u8]) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            ttl: Duration::days(TOKEN_TTL_DAYS),
        }
    }

    pub fn from_env() -> Self {
        match env_string("JWT_SECRET") {
            Some(secret) => Self::from_secret(secret.as_bytes()),
            None => {
                warn!(
                    target = "auction.auth",
                    "JWT_SECRET not set; tokens are signed with an ephemeral key and will not survive a restart"
                );
                Self::from_secret(&rand::random::<[u8; 32]>())
            }
        }
    }

    pub fn issue(&self, user_id: &str) -> Result<String, AuthError> {
        let now = Utc::now();
        let claims = Claims {
            sub: user_id.to_string(),
            iat: now.timestamp() as usize,
            exp: (now + self.ttl).timestamp() as usize,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|err| AuthError::Hash(err.to_string()))
    }

    /// Returns the user id the token was issued for.
    pub fn verify(&self, token: &str) -> Result<String, AuthError> {
        decode::<Claims>(token, &self.decoding, &Validation::new(Algorithm::HS256))
            .map(|data| data.claims.sub)
            .map_err(|_| AuthError::InvalidToken)
    }
}

/// The authenticated caller, inserted as a request extension by
/// [`require_auth`].
#[derive(Clone, Debug)]
pub struct AuthUser {
    pub user_id: String,
    pub email: String,
    pub role: Role,
    pub name: String,
}

impl From<User> for AuthUser {
    fn from(user: User) -> Self {
        Self {
            user_id: user.user_id,
            email: user.email,
            role: user.role,
            name: user.name,
        }
    }
}

impl AuthUser {
    pub fn require(&self, role: Role) -> Result<(), AuthError> {
        if self.role == role {
            Ok(())
        } else {
            Err(AuthError::Forbidden(role.as_str()))
        }
    }
}

#[derive(Clone)]
pub struct AuthState {
    store: SharedStore,
    jwt: Arc<JwtConfig>,
    limiter: Arc<TokenBuckets>,
}

impl AuthState {
    pub fn new(store: SharedStore, jwt: Arc<JwtConfig>, limiter: TokenBuckets) -> Self {
        Self {
            store,
            jwt,
            limiter: Arc::new(limiter),
        }
    }

    async fn authenticate(&self, token: &str) -> Result<AuthUser, AuthError> {
        let user_id = self.jwt.verify(token)?;
        match self.store.find_user(&user_id).await {
            Ok(Some(user)) => Ok(user.into()),
            Ok(None) => Err(AuthError::UnknownUser),
            Err(err) => {
                error!(target = "auction.auth", error = %err, "user lookup failed");
                Err(AuthError::Store(err))
            }
        }
    }
}

pub async fn require_auth(
    State(state): State<AuthState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    let Some(token) = extract_bearer(request.headers()) else {
        return Ok(AuthError::MissingToken.into_response());
    };

    let user = match state.authenticate(&token).await {
        Ok(user) => user,
        Err(err) => return Ok(err.into_response()),
    };

    match state.limiter.consume(&user.user_id).await {
        Ok(permit) => {
            request.extensions_mut().insert(user);
            let mut response = next.run(request).await;
            permit.apply_headers(response.headers_mut());
            Ok(response)
        }
        Err(exceeded) => {
            let payload = ApiError {
                error: "rate_limited".into(),
                detail: Some("Too many requests".into()),
            };
            let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(payload)).into_response();
            exceeded.apply_headers(response.headers_mut());
            Ok(response)
        }
    }
}

fn extract_bearer(headers: &http::HeaderMap) -> Option<String> {
    let raw = headers.get(http::header::AUTHORIZATION)?.to_str().ok()?;
    if raw.len() >= 7 && raw[..6].eq_ignore_ascii_case("bearer") {
        Some(raw[6..].trim().to_string()).filter(|token| !token.is_empty())
    } else {
        None
    }
}

/// Per-user token buckets refilled continuously at `rate_per_sec`. A bucket
/// idle long enough to refill completely is dropped, since a fresh one is
/// identical.
pub struct TokenBuckets {
    rate_per_sec: f64,
    capacity: f64,
    buckets: Mutex<Buckets>,
}

struct Buckets {
    entries: HashMap<String, BucketState>,
    last_sweep: Instant,
}

impl TokenBuckets {
    pub fn new(rate_per_sec: f64, capacity: f64) -> Self {
        Self {
            rate_per_sec,
            capacity,
            buckets: Mutex::new(Buckets {
                entries: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        }
    }

    fn refill_window(&self) -> StdDuration {
        StdDuration::from_secs_f64((self.capacity / self.rate_per_sec).min(86_400.0))
    }

    pub fn from_env() -> Self {
        let rate = env_parse::<f64>("RATE_LIMIT_PER_SEC")
            .filter(|value| *value > 0.0)
            .unwrap_or(5.0);
        let capacity = env_parse::<f64>("RATE_LIMIT_CAPACITY")
            .filter(|value| *value >= 1.0)
            .unwrap_or(20.0);
        Self::new(rate, capacity)
    }

    async fn consume(&self, key: &str) -> Result<RateWindow, RateWindow> {
        let mut guard = self.buckets.lock().await;
        let now = Instant::now();
        let window = self.refill_window();
        if now.duration_since(guard.last_sweep) >= window {
            guard
                .entries
                .retain(|_, bucket| now.duration_since(bucket.last_refill) < window);
            guard.last_sweep = now;
        }
        let state = guard.entries.entry(key.to_string()).or_insert_with(|| BucketState {
            tokens: self.capacity,
            last_refill: now,
        });

        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            state.tokens = (state.tokens + elapsed * self.rate_per_sec).min(self.capacity);
            state.last_refill = now;
        }

        let mut window = RateWindow {
            capacity: self.capacity,
            tokens: state.tokens,
            rate: self.rate_per_sec,
            retry_after: None,
        };
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            window.tokens = state.tokens;
            Ok(window)
        } else {
            window.retry_after = Some(((1.0 - state.tokens) / self.rate_per_sec).max(0.0));
            Err(window)
        }
    }
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Bucket snapshot rendered into `X-RateLimit-*` headers, plus
/// `Retry-After` when the request was refused.
#[derive(Debug, Clone)]
struct RateWindow {
    capacity: f64,
    tokens: f64,
    rate: f64,
    retry_after: Option<f64>,
}

impl RateWindow {
    fn apply_headers(&self, headers: &mut http::HeaderMap) {
        let remaining = self.tokens.max(0.0).floor() as u64;
        let reset = ((self.capacity - self.tokens) / self.rate).ceil().max(0.0) as u64;
        headers.insert("X-RateLimit-Limit", HeaderValue::from(self.capacity as u64));
        headers.insert("X-RateLimit-Remaining", HeaderValue::from(remaining));
        headers.insert("X-RateLimit-Reset", HeaderValue::from(reset));
        if let Some(retry) = self.retry_after {
            headers.insert(
                http::header::RETRY_AFTER,
                HeaderValue::from(retry.ceil().max(1.0) as u64),
            );
        }
    }
}
