// Status/metrics HTTP surface served from the shared export state.

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use tokio::sync::RwLock;

    use crate::config::settings::MetricsConfig;
    use crate::observability::metrics::get_metrics;
    use crate::server::server::{app, AppState};
    use crate::sources::export::{ExportJob, ExportState};
    use crate::tests::common::*;

    #[tokio::test]
    async fn status_reports_current_export_state() {
        let export_state = Arc::new(RwLock::new(ExportState::NotStarted));
        let state = AppState::new(get_metrics().await.clone(), export_state.clone());
        let (_h, addr) = spawn_axum(app(&MetricsConfig::default(), state)).await;
        let client = build_reqwest_client();
        let url = format!("http://{}/status", addr);

        let body: serde_json::Value = client.get(&url).send().await.unwrap().json().await.unwrap();
        assert_eq!(body, json!({"state": "not_started"}));

        *export_state.write().await = ExportState::Polling {
            job: ExportJob::new("https://vendor.test/poll/1", 30),
            polls: 2,
            progress: Some("40%".to_owned()),
        };
        let body: serde_json::Value = client.get(&url).send().await.unwrap().json().await.unwrap();
        assert_eq!(body["state"], "polling");
        assert_eq!(body["job"]["retry_after"], 30);
        assert_eq!(body["progress"], "40%");

        // metrics disabled by default
        let metrics = client.get(format!("http://{}/metrics", addr)).send().await.unwrap();
        assert_eq!(metrics.status(), 404);
    }

    #[tokio::test]
    async fn metrics_endpoint_renders_prometheus_text() {
        let metrics_config = MetricsConfig {
            path: "/internal/metrics".to_owned(),
            is_enabled: true,
        };
        let export_state = Arc::new(RwLock::new(ExportState::NotStarted));
        let state = AppState::new(get_metrics().await.clone(), export_state);
        let (_h, addr) = spawn_axum(app(&metrics_config, state)).await;

        let response = build_reqwest_client()
            .get(format!("http://{}/internal/metrics", addr))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let text = response.text().await.unwrap();
        assert!(text.contains("fhirbulk_export_state"), "{}", text);
    }
}
