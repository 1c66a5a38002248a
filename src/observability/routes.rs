use axum::routing::get;
use axum::{extract::State, response::IntoResponse, Json, Router};
use http::{header::CONTENT_TYPE, StatusCode};

use crate::config::settings::MetricsConfig;
use crate::server::server::AppState;

pub const STATUS_PATH: &str = "/status";

/// `/status` always, the metrics path when enabled.
pub fn router(metrics_config: &MetricsConfig) -> Router<AppState> {
    let mut router = Router::new().route(STATUS_PATH, get(get_status));
    if metrics_config.is_enabled {
        router = router.route(metrics_config.path.as_str(), get(get_metrics));
    }
    router
}

async fn get_metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.export_state.read().await.clone())
}
