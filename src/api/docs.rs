use super::AppState;
use crate::config::env_string;
use axum::{
    Json,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{Html, IntoResponse, Response},
};
use serde_json::{Value, json};

const OPENAPI_YAML: &str = include_str!("../../docs/openapi.yaml");

pub fn load_openapi() -> Value {
    serde_yaml::from_str(OPENAPI_YAML).unwrap_or_else(|_| json!({"openapi": "3.0.3"}))
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
///
/// Returns `status`, `service` and the active store backend.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "sealed-auction-api",
        "store": state.store().backend(),
        "idempotency": state.idempotency.backend(),
    }))
}

pub async fn openapi_json(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if !key_matches(&headers, "OPENAPI_KEY", "X-Docs-Key") {
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }
    Json((*state.openapi).clone()).into_response()
}

pub async fn swagger_ui() -> Html<&'static str> {
    Html(
        r#"<!doctype html>
<html>
<head>
  <meta charset='utf-8'/>
  <title>Sealed Auction API Docs</title>
  <link rel="stylesheet" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css" />
</head>
<body>
  <div id="swagger-ui"></div>
  <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js"></script>
  <script>
    window.onload = () => {
      window.ui = SwaggerUIBundle({ url: '/openapi.json', dom_id: '#swagger-ui' });
    };
  </script>
</body>
</html>"#,
    )
}

pub async fn metrics(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if !key_matches(&headers, "METRICS_KEY", "X-Metrics-Key") {
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.prometheus.render(),
    )
        .into_response()
}

/// Open when `env_key` is unset; otherwise `header_name` must carry its value.
fn key_matches(headers: &HeaderMap, env_key: &str, header_name: &str) -> bool {
    let Some(secret) = env_string(env_key) else {
        return true;
    };
    headers
        .get(header_name)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|presented| presented == secret)
}
