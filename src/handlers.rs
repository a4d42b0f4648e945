use axum::{extract::State, http::header, response::IntoResponse, Json};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;

use crate::websocket::RelayState;

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    status: &'static str,
    active_pairs: usize,
}

/// GET /health - Health check endpoint
pub async fn health_check(State(state): State<RelayState>) -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "ok",
        active_pairs: state.registry.pair_count(),
    })
}

/// GET /metrics - Prometheus metrics scrape endpoint
pub async fn metrics_handler(State(handle): State<PrometheusHandle>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        handle.render(),
    )
}
