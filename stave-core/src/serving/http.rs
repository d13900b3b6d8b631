//! HTTP request surface
//!
//! `GET /{dataset}/{key}` answers from the served version and reports it in
//! the version header. Also serves health, status and metrics.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::convergence::ConvergenceCoordinator;
use crate::metrics::{gather_system_metrics, standard};
use crate::node::NodeStatus;
use crate::VERSION_HEADER;

#[derive(Clone)]
struct HttpState {
    identity: Arc<str>,
    datasets: Arc<BTreeMap<String, Arc<ConvergenceCoordinator>>>,
}

/// Build the request router for a node
pub fn router(
    identity: &str,
    datasets: Arc<BTreeMap<String, Arc<ConvergenceCoordinator>>>,
) -> Router {
    let state = HttpState {
        identity: Arc::from(identity),
        datasets,
    };

    Router::new()
        .route("/healthz", get(healthz))
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .route("/:dataset/:key", get(lookup))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn metrics() -> String {
    gather_system_metrics()
}

async fn status(State(state): State<HttpState>) -> Json<NodeStatus> {
    Json(NodeStatus::collect(&state.identity, &state.datasets))
}

async fn lookup(
    State(state): State<HttpState>,
    Path((dataset, key)): Path<(String, String)>,
) -> Response {
    standard::REQUESTS.inc();

    let Some(coordinator) = state.datasets.get(&dataset) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let serving = coordinator.controller().current();
    let Some(version) = serving.version() else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(version.as_str()) {
        headers.insert(VERSION_HEADER, value);
    }

    match serving.get(&key) {
        Some(value) => (StatusCode::OK, headers, value).into_response(),
        None => (StatusCode::NOT_FOUND, headers).into_response(),
    }
}
