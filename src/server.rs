//! HTTP adapter over [`AnalyticsService`].
//!
//! Handlers only translate between HTTP and the service: every decision about
//! readiness, missing data or limits is made in [`crate::query`].

use crate::error::QueryError;
use crate::query::{AnalyticsService, Loadable};
use crate::source::ChunkSource;
use anyhow::Context;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::Future;
use tokio::net::TcpListener;

const DEFAULT_PAGE_SIZE: usize = 100;

#[derive(Debug, Serialize)]
struct ErrorBody {
    detail: String,
}

#[derive(Debug, Deserialize)]
struct RowsParams {
    #[serde(default)]
    offset: usize,
    /// Omitted: the default page size, capped at the configured maximum
    #[serde(default)]
    limit: Option<usize>,
}

impl RowsParams {
    fn page_size(&self, max: usize) -> usize {
        self.limit.unwrap_or_else(|| DEFAULT_PAGE_SIZE.min(max))
    }
}

fn error_response(status: StatusCode, detail: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            detail: detail.into(),
        }),
    )
        .into_response()
}

impl IntoResponse for QueryError {
    fn into_response(self) -> Response {
        let status = match &self {
            QueryError::NotFound(_) => StatusCode::NOT_FOUND,
            QueryError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            QueryError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            QueryError::Source(e) => {
                tracing::error!("Request failed: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        error_response(status, self.to_string())
    }
}

/// Build the router. State is the service itself.
pub fn router<S: ChunkSource>(service: AnalyticsService<S>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/status", get(status::<S>))
        .route("/analytics/overview", get(overview::<S>))
        .route("/analytics/revenue", get(revenue::<S>))
        .route("/journey/edges", get(journey_edges::<S>))
        .route("/journey/{email}", get(customer_journey::<S>))
        .route("/data/rows", get(rows::<S>))
        .route("/data/refresh", post(refresh::<S>))
        .with_state(service)
}

/// Bind `addr` and serve until `shutdown` resolves.
pub async fn serve<S, F>(addr: &str, service: AnalyticsService<S>, shutdown: F) -> anyhow::Result<()>
where
    S: ChunkSource,
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    let local = listener.local_addr().context("listener has no local address")?;
    tracing::info!("Listening on http://{}", local);

    axum::serve(listener, router(service))
        .with_graceful_shutdown(shutdown)
        .await
        .context("server shutdown")?;
    Ok(())
}

async fn root() -> Json<serde_json::Value> {
    Json(json!({"status": "ok", "message": "Customer Journey API"}))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

async fn status<S: ChunkSource>(State(service): State<AnalyticsService<S>>) -> Json<serde_json::Value> {
    let status = service.status();
    Json(json!({
        "ready": status.ready,
        "progress": status.progress,
        "last_refresh": service.last_refresh(),
    }))
}

async fn overview<S: ChunkSource>(State(service): State<AnalyticsService<S>>) -> Response {
    match service.overview() {
        Loadable::Loading { progress } => Json(json!({
            "status": "loading",
            "message": "Data is being prepared. Please try again shortly.",
            "progress": progress,
        }))
        .into_response(),
        Loadable::Empty => Json(json!({"status": "empty"})).into_response(),
        Loadable::Ready(overview) => Json(overview).into_response(),
    }
}

async fn revenue<S: ChunkSource>(State(service): State<AnalyticsService<S>>) -> Response {
    match service.revenue_breakdown() {
        Loadable::Loading { progress } => Json(json!({
            "status": "loading",
            "message": "Data is being prepared.",
            "progress": progress,
        }))
        .into_response(),
        Loadable::Empty => Json(json!({"status": "empty"})).into_response(),
        Loadable::Ready(breakdown) => Json(breakdown).into_response(),
    }
}

async fn journey_edges<S: ChunkSource>(State(service): State<AnalyticsService<S>>) -> Response {
    match service.journey_edges() {
        Ok(edges) => Json(edges).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn customer_journey<S: ChunkSource>(
    State(service): State<AnalyticsService<S>>,
    Path(email): Path<String>,
) -> Response {
    match service.customer_journey(&email).await {
        Ok(journey) => Json(journey).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn rows<S: ChunkSource>(
    State(service): State<AnalyticsService<S>>,
    Query(params): Query<RowsParams>,
) -> Response {
    let limit = params.page_size(service.max_rows_limit());
    match service.raw_rows(params.offset, limit).await {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn refresh<S: ChunkSource>(State(service): State<AnalyticsService<S>>) -> Response {
    let ticket = service.trigger_refresh();
    if ticket.scheduled {
        (StatusCode::ACCEPTED, Json(json!({"status": "scheduled"}))).into_response()
    } else {
        (
            StatusCode::CONFLICT,
            Json(json!({"status": "running", "detail": ticket.reason})),
        )
            .into_response()
    }
}
