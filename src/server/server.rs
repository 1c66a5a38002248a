use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::settings::{MetricsConfig, ServerConfig};
use crate::observability::metrics::{get_metrics, Metrics};
use crate::observability::routes;
use crate::sources::export::ExportStateHandle;

#[derive(Clone)]
pub struct AppState {
    pub metrics: Arc<Metrics>,
    pub export_state: ExportStateHandle,
}

impl AppState {
    pub fn new(metrics: Arc<Metrics>, export_state: ExportStateHandle) -> Self {
        Self {
            metrics,
            export_state,
        }
    }
}

pub fn app(metrics_config: &MetricsConfig, state: AppState) -> Router {
    routes::router(metrics_config).with_state(state)
}

/// Serve `/status` and metrics until `shutdown` fires.
pub async fn start(
    server_config: &ServerConfig,
    metrics_config: &MetricsConfig,
    export_state: ExportStateHandle,
    shutdown: CancellationToken,
) -> Result<()> {
    let metrics = get_metrics().await.clone();
    let app = app(metrics_config, AppState::new(metrics, export_state));

    let addr = format!("{}:{}", server_config.host, server_config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("cannot bind status server to {}", addr))?;
    info!("status server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .context("status server failed")?;
    info!("status server stopped");
    Ok(())
}
