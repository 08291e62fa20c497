//! Probe and metrics endpoints
//!
//! - `/health`: liveness
//! - `/ready`: Redis PING
//! - `/metrics`: Prometheus text format

use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use redis::aio::ConnectionManager;
use serde_json::{Value, json};
use std::sync::Arc;

#[derive(Clone)]
pub struct HealthState {
    pub redis: Arc<ConnectionManager>,
    pub routes: usize,
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

async fn health_handler(State(state): State<HealthState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "routes": state.routes,
    }))
}

async fn ready_handler(State(state): State<HealthState>) -> (StatusCode, Json<Value>) {
    let mut conn = (*state.redis).clone();
    let result: Result<String, _> = redis::cmd("PING").query_async(&mut conn).await;

    match result {
        Ok(_) => (
            StatusCode::OK,
            Json(json!({ "status": "ready", "checks": { "redis": "ok" } })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "not_ready", "checks": { "redis": e.to_string() } })),
        ),
    }
}

async fn metrics_handler() -> impl IntoResponse {
    match stream_broker::metrics::prometheus_handle() {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            handle.render(),
        ),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "metrics recorder not installed".to_string(),
        ),
    }
}
