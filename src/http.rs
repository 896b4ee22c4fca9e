//! HTTP listener for the query surface and Prometheus metrics.
//!
//! Runs on its own tokio task. Query handlers are read-only and served
//! from the connection pool in parallel with the write pipeline.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::query::{
    BackwardEdgesRequest, BackwardEdgesResponse, EventExistsRequest, EventExistsResponse,
    LatestEventsAndStateRequest, LatestEventsAndStateResponse, QueryApi, StateAfterEventsRequest,
    StateAfterEventsResponse,
};

/// Build the HTTP router over the query API.
pub fn router(api: QueryApi) -> Router {
    Router::new()
        .route("/query/latestEventsAndState", post(latest_events_and_state))
        .route("/query/stateAfterEvents", post(state_after_events))
        .route("/query/backwardEdges", post(backward_edges))
        .route("/query/eventExists", post(event_exists))
        .route("/metrics", get(metrics_handler))
        .with_state(api)
}

/// Run the HTTP server until the cancellation token fires.
pub async fn run_http_server(
    addr: SocketAddr,
    api: QueryApi,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Query HTTP server listening on {}", addr);
    axum::serve(listener, router(api))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}

async fn latest_events_and_state(
    State(api): State<QueryApi>,
    Json(request): Json<LatestEventsAndStateRequest>,
) -> Result<Json<LatestEventsAndStateResponse>, StatusCode> {
    api.latest_events_and_state(&request)
        .await
        .map(Json)
        .map_err(internal_error)
}

async fn state_after_events(
    State(api): State<QueryApi>,
    Json(request): Json<StateAfterEventsRequest>,
) -> Result<Json<StateAfterEventsResponse>, StatusCode> {
    api.state_after_events(&request)
        .await
        .map(Json)
        .map_err(internal_error)
}

async fn backward_edges(
    State(api): State<QueryApi>,
    Json(request): Json<BackwardEdgesRequest>,
) -> Result<Json<BackwardEdgesResponse>, StatusCode> {
    api.backward_edges(&request).await.map(Json).map_err(internal_error)
}

async fn event_exists(
    State(api): State<QueryApi>,
    Json(request): Json<EventExistsRequest>,
) -> Result<Json<EventExistsResponse>, StatusCode> {
    api.event_exists(&request).await.map(Json).map_err(internal_error)
}

/// Handler for GET /metrics - returns Prometheus metrics in text format.
async fn metrics_handler() -> String {
    crate::metrics::gather_metrics()
}

fn internal_error(e: crate::error::InputError) -> StatusCode {
    error!(error = %e, "Query failed");
    StatusCode::INTERNAL_SERVER_ERROR
}
