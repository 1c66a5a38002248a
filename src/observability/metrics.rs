use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::info;

// Declare the static OnceCell to hold the Metrics.
static METRICS_INSTANCE: OnceCell<Arc<Metrics>> = OnceCell::const_new();

/// Asynchronously initializes and gets a reference to the static `Metrics`.
pub async fn get_metrics() -> &'static Arc<Metrics> {
    METRICS_INSTANCE
        .get_or_init(|| async {
            info!("Initializing Metrics ...");
            Metrics::new()
        })
        .await
}

#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    // Discovery + auth
    pub discovery_requests: IntCounterVec,
    pub token_requests: IntCounterVec,

    // Export lifecycle
    pub export_starts: IntCounterVec,
    pub export_polls: IntCounterVec,
    /// numeric code of the current ExportState
    pub export_state: IntGauge,

    // Downloads
    pub download_files: IntCounterVec,
    pub download_records: IntCounterVec,

    pub request_duration: HistogramVec,

    // Config/runtime
    pub config_validation_errors: IntCounter,
}

impl Metrics {
    fn new() -> Arc<Self> {
        let registry = Registry::new_custom(Some("fhirbulk".into()), None)
            .expect("static registry prefix is valid");

        let metrics = Arc::new(Self {
            discovery_requests: counter_vec("discovery_requests_total", "Smart configuration fetches by outcome", &["outcome"]),
            token_requests: counter_vec("token_requests_total", "Client-credentials exchanges by outcome", &["outcome"]),
            export_starts: counter_vec("export_starts_total", "Export kick-off requests by outcome", &["outcome"]),
            export_polls: counter_vec("export_polls_total", "Export status polls by status class", &["class"]),
            export_state: IntGauge::new("export_state", "Current export state (0 not started .. 6 cancelled)")
                .expect("valid metric"),
            download_files: counter_vec("download_files_total", "Downloaded ndjson files", &["resource_type", "outcome"]),
            download_records: counter_vec("download_records_total", "Parsed ndjson records", &["resource_type"]),
            request_duration: HistogramVec::new(
                HistogramOpts::new("request_duration_seconds", "Vendor request duration seconds")
                    .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 15.0, 60.0]),
                &["operation"],
            )
            .expect("valid metric"),
            config_validation_errors: IntCounter::new(
                "config_validation_errors_total",
                "Validation errors during config load",
            )
            .expect("valid metric"),
            registry,
        });

        // Register all metrics in the registry
        let reg = &metrics.registry;
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(metrics.discovery_requests.clone()),
            Box::new(metrics.token_requests.clone()),
            Box::new(metrics.export_starts.clone()),
            Box::new(metrics.export_polls.clone()),
            Box::new(metrics.export_state.clone()),
            Box::new(metrics.download_files.clone()),
            Box::new(metrics.download_records.clone()),
            Box::new(metrics.request_duration.clone()),
            Box::new(metrics.config_validation_errors.clone()),
        ];
        for collector in collectors {
            reg.register(collector).expect("metric registered once");
        }

        metrics
    }

    /// Prometheus text exposition of every registered metric.
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(err) = encoder.encode(&self.registry.gather(), &mut buffer) {
            return format!("# metrics encoding failed: {}", err);
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    IntCounterVec::new(Opts::new(name, help), labels).expect("valid metric")
}

pub const OUTCOME_OK: &str = "ok";
pub const OUTCOME_ERROR: &str = "error";
