use crate::format::FormatHint;
use crate::locator::parse_query;
use crate::orchestrator::{MediaRequest, Outcome, serve_media};
use crate::state::AppState;
use crate::storage::StoredObject;
use axum::extract::{Path, RawQuery, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;
use url::Url;

const CACHED_OBJECT_TTL_SECONDS: u64 = 31_536_000;
const FORBIDDEN_BODY: &str = "URL is not allowed";
const SERVER_ERROR_BODY: &str = "Server error";

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/status", get(status))
        .route("/{transformation}/{*locator}", get(media))
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    jobs: JobsStatus,
    presets: usize,
    custom_transformations: bool,
    storage: &'static str,
}

#[derive(Debug, Serialize)]
struct JobsStatus {
    running: usize,
    capacity: usize,
}

async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        jobs: JobsStatus {
            running: state.jobs.running(),
            capacity: state.jobs.capacity(),
        },
        presets: state.presets().len(),
        custom_transformations: state.config.allow_custom_transformations,
        storage: state.store.backend(),
    })
}

async fn media(
    State(state): State<Arc<AppState>>,
    Path((transformation, locator)): Path<(String, String)>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    let accept = headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let request = MediaRequest {
        transformation,
        locator,
        query: parse_query(query.as_deref()),
        accept,
    };
    match serve_media(&state, request).await {
        Outcome::Forbidden => (StatusCode::FORBIDDEN, FORBIDDEN_BODY).into_response(),
        Outcome::Redirect {
            location,
            cache_miss,
        } => redirect_response(&location, cache_miss),
        Outcome::Cached { object, format } => cached_response(object, format),
        Outcome::Failed => server_error(),
    }
}

fn redirect_response(location: &str, cache_miss: bool) -> Response {
    let Some(location) = location_header(location) else {
        return server_error();
    };
    let mut headers = HeaderMap::new();
    headers.insert(header::LOCATION, location);
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    if cache_miss {
        headers.insert("X-Cache", HeaderValue::from_static("MISS"));
    }
    (StatusCode::FOUND, headers).into_response()
}

/// Percent-encoded URL form; the raw text only when it is not an absolute
/// URL (relative locators).
fn location_header(location: &str) -> Option<HeaderValue> {
    match Url::parse(location) {
        Ok(parsed) => HeaderValue::from_str(parsed.as_str()).ok(),
        Err(_) => HeaderValue::from_str(location).ok(),
    }
}

fn cached_response(object: StoredObject, format: FormatHint) -> Response {
    let content_type = object
        .content_type
        .as_deref()
        .and_then(|value| HeaderValue::from_str(value).ok())
        .or_else(|| format.known().map(|format| HeaderValue::from_static(format.mime())))
        .unwrap_or_else(|| HeaderValue::from_static("application/octet-stream"));
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, content_type);
    if let Ok(value) = HeaderValue::from_str(&cache_control_header(CACHED_OBJECT_TTL_SECONDS)) {
        headers.insert(header::CACHE_CONTROL, value);
    }
    headers.insert("X-Cache", HeaderValue::from_static("HIT"));
    if let Some(length) = object.content_length {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    }
    (StatusCode::OK, headers, object.body).into_response()
}

fn server_error() -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, SERVER_ERROR_BODY).into_response()
}

fn cache_control_header(ttl_seconds: u64) -> String {
    format!("public, max-age={ttl_seconds}")
}
