use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::CorsLayer;

use crate::health::{HealthRegistry, SourceHealth};

#[derive(Clone)]
pub struct AppState {
    pub health: Arc<HealthRegistry>,
    /// `None` when no Prometheus recorder is installed (tests).
    pub metrics: Option<PrometheusHandle>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/sources", get(list_sources))
        .route("/sources/{name}", get(one_source))
        .route("/metrics", get(render_metrics))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

async fn list_sources(State(state): State<AppState>) -> Json<BTreeMap<String, SourceHealth>> {
    Json(state.health.snapshot())
}

async fn one_source(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<SourceHealth>, StatusCode> {
    state
        .health
        .snapshot()
        .remove(&name)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn render_metrics(State(state): State<AppState>) -> Result<String, StatusCode> {
    state
        .metrics
        .as_ref()
        .map(|h| h.render())
        .ok_or(StatusCode::SERVICE_UNAVAILABLE)
}
