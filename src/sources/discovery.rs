use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{snippet, BulkError, BulkResult};
use crate::helpers::time::get_instant;
use crate::observability::metrics::{get_metrics, OUTCOME_ERROR, OUTCOME_OK};
use crate::resilience::retry::RetrySettings;
use crate::sources::request::{normalize_base_url, smart_configuration_url};

/// Vendor OAuth metadata published at `.well-known/smart-configuration`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmartConfiguration {
    pub token_endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization_endpoint: Option<String>,
    /// every other vendor field, kept verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Fetches and caches the smart configuration of one FHIR base URL.
#[derive(Debug)]
pub struct DiscoveryClient {
    client: Client,
    base_url: String,
    timeout: Duration,
    retry: RetrySettings,
    cached: RwLock<Option<SmartConfiguration>>,
}

impl DiscoveryClient {
    pub fn new(client: Client, base_url: &str, timeout: Duration) -> Self {
        Self {
            client,
            base_url: normalize_base_url(base_url),
            timeout,
            retry: RetrySettings::default(),
            cached: RwLock::new(None),
        }
    }

    pub fn with_retry(mut self, retry: RetrySettings) -> Self {
        self.retry = retry;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Always hits the vendor and replaces the cached document.
    pub async fn fetch(&self) -> BulkResult<SmartConfiguration> {
        let metrics = get_metrics().await;
        let start = get_instant();
        let result = self
            .retry
            .run_with_retry("smart configuration", || self.fetch_once())
            .await;
        metrics
            .request_duration
            .with_label_values(&["discovery"])
            .observe(start.elapsed().as_secs_f64());

        match result {
            Ok(configuration) => {
                metrics.discovery_requests.with_label_values(&[OUTCOME_OK]).inc();
                info!(token_endpoint = %configuration.token_endpoint, "smart configuration discovered");
                *self.cached.write().await = Some(configuration.clone());
                Ok(configuration)
            }
            Err(err) => {
                metrics.discovery_requests.with_label_values(&[OUTCOME_ERROR]).inc();
                warn!("smart configuration discovery failed: {}", err);
                Err(err)
            }
        }
    }

    async fn fetch_once(&self) -> BulkResult<SmartConfiguration> {
        let url = smart_configuration_url(&self.base_url);
        debug!("GET {}", url);
        let response = self.client.get(&url).timeout(self.timeout).send().await?;
        let status = response.status();
        let body = response.text().await?;

        if status != StatusCode::OK {
            return Err(BulkError::Discovery {
                url,
                reason: format!("status {}: {}", status.as_u16(), snippet(&body)),
            });
        }
        serde_json::from_str::<SmartConfiguration>(&body).map_err(|e| BulkError::Discovery {
            url,
            reason: format!("malformed smart configuration: {}", e),
        })
    }

    /// Cached document, discovering it on first use.
    pub async fn configuration(&self) -> BulkResult<SmartConfiguration> {
        if let Some(configuration) = self.cached().await {
            return Ok(configuration);
        }
        self.fetch().await
    }

    pub async fn cached(&self) -> Option<SmartConfiguration> {
        self.cached.read().await.clone()
    }

    /// Replace the discovered document, for vendors that publish wrong endpoints.
    pub async fn override_with(&self, configuration: SmartConfiguration) {
        info!(token_endpoint = %configuration.token_endpoint, "smart configuration overridden");
        *self.cached.write().await = Some(configuration);
    }

    pub async fn token_endpoint(&self) -> BulkResult<String> {
        self.cached()
            .await
            .map(|configuration| configuration.token_endpoint)
            .ok_or_else(not_discovered)
    }

    pub async fn authorization_endpoint(&self) -> BulkResult<String> {
        self.cached()
            .await
            .ok_or_else(not_discovered)?
            .authorization_endpoint
            .ok_or_else(|| {
                BulkError::Configuration(
                    "vendor did not publish an authorization_endpoint".to_owned(),
                )
            })
    }
}

fn not_discovered() -> BulkError {
    BulkError::Configuration("smart configuration has not been discovered yet".to_owned())
}
