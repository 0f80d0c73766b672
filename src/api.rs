//! Search API — the read side of the pipeline.
//!
//! Routes, all under `/v1/projects`:
//!
//! ```text
//! GET  /v1/projects/user/{id}        user + their projects + hashtags
//! GET  /v1/projects/hashtags/{tag}   hashtags + projects + users
//! POST /v1/projects/search           fuzzy slug/description project search
//! GET  /v1/projects/health-check     liveness pong
//! GET  /v1/projects/metrics          uptime + request counters
//! ```
//!
//! Every error response carries the same JSON envelope:
//! `{"errorCode", "errorMessage", "errorData"}`. A missing seed document
//! is a 404; an index transport failure is a 500 with a generic message.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

use crate::query::{QueryEngine, QueryError};

/// Request counters for the metrics endpoint.
pub struct Metrics {
    start_time: Instant,
    queries_served: AtomicU64,
}

impl Metrics {
    fn new() -> Self {
        Self {
            start_time: Instant::now(),
            queries_served: AtomicU64::new(0),
        }
    }

    fn record_query(&self) {
        self.queries_served.fetch_add(1, Ordering::Relaxed);
    }

    fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

#[derive(Clone)]
pub struct AppState {
    query: QueryEngine,
    metrics: Arc<Metrics>,
}

impl AppState {
    pub fn new(query: QueryEngine) -> Self {
        Self {
            query,
            metrics: Arc::new(Metrics::new()),
        }
    }
}

/// Build the API router over a shared query engine.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/projects/user/{id}", get(projects_by_user))
        .route("/v1/projects/hashtags/{tag}", get(projects_by_hashtag))
        .route("/v1/projects/search", post(search_projects))
        .route("/v1/projects/health-check", get(health_check))
        .route("/v1/projects/metrics", get(metrics))
        .with_state(state)
}

/// JSON error envelope carried by every non-2xx response.
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    data: Value,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "BAD_REQUEST",
            message: message.into(),
            data: Value::Null,
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "RESOURCE_NOT_FOUND",
            message: message.into(),
            data: Value::Null,
        }
    }

    fn internal() -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "INTERNAL_ERROR",
            message: "Internal Server Error".to_string(),
            data: Value::Null,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "errorCode": self.code,
            "errorMessage": self.message,
            "errorData": self.data,
        });
        (self.status, Json(body)).into_response()
    }
}

impl From<QueryError> for ApiError {
    fn from(err: QueryError) -> Self {
        match err {
            QueryError::UserNotFound(id) => ApiError::not_found(format!("user {id} not found")),
            QueryError::HashtagNotFound(tag) => {
                ApiError::not_found(format!("no hashtag matches '{tag}'"))
            }
            QueryError::Index(e) => {
                error!(error = %e, "index query failed");
                ApiError::internal()
            }
        }
    }
}

async fn projects_by_user(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.metrics.record_query();

    let user_id: i64 = id
        .parse()
        .map_err(|_| ApiError::bad_request(format!("invalid user id '{id}'")))?;

    let view = state.query.projects_by_user(user_id).await?;
    Ok(Json(view))
}

async fn projects_by_hashtag(
    State(state): State<AppState>,
    Path(tag): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.metrics.record_query();

    if tag.trim().is_empty() {
        return Err(ApiError::bad_request("hashtag must not be empty"));
    }

    let view = state.query.projects_by_hashtag(&tag).await?;
    Ok(Json(view))
}

#[derive(Debug, Deserialize)]
struct SearchRequest {
    slug: Option<String>,
    description: Option<String>,
}

async fn search_projects(
    State(state): State<AppState>,
    payload: Result<Json<SearchRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    state.metrics.record_query();

    let Json(request) =
        payload.map_err(|e| ApiError::bad_request(format!("invalid request body: {e}")))?;

    if request.slug.is_none() && request.description.is_none() {
        return Err(ApiError::bad_request(
            "provide at least one of 'slug' or 'description'",
        ));
    }

    let view = state
        .query
        .search_projects(request.slug.as_deref(), request.description.as_deref())
        .await?;
    Ok(Json(view))
}

async fn health_check() -> Json<Value> {
    info!("health check");
    Json(json!({ "message": "pong" }))
}

async fn metrics(State(state): State<AppState>) -> Json<Value> {
    let uptime = state.metrics.uptime_seconds();
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": uptime,
        "queries_served": state.metrics.queries_served.load(Ordering::Relaxed),
        "status": "running",
    }))
}
