//! One export run wired from configuration: discover, authorize, export,
//! wait, download and persist.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use reqwest::Client;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::service::ServiceConfig;
use crate::error::BulkError;
use crate::resilience::retry::RetrySettings;
use crate::sinks::ndjson_file::{NdjsonFileSink, WrittenFile};
use crate::sources::authenticator::Authenticator;
use crate::sources::discovery::DiscoveryClient;
use crate::sources::download::{ManifestDownloader, ResourceBatch};
use crate::sources::export::{ExportJob, ExportJobManager, ExportStateHandle};
use crate::sources::signer::KeySigner;

/// Where a resumed run finds its poll URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeFrom {
    Url(String),
    /// the job recorded in the output directory by an earlier run
    JobFile,
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// overrides `export.group_id`
    pub group_id: Option<String>,
    pub resume: Option<ResumeFrom>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub job: ExportJob,
    pub transaction_time: Option<String>,
    pub files: Vec<WrittenFile>,
    pub records: usize,
    pub error_records: usize,
}

pub struct BulkSession {
    config: ServiceConfig,
    auth: Arc<Authenticator>,
    manager: ExportJobManager,
    downloader: ManifestDownloader,
    sink: NdjsonFileSink,
}

impl BulkSession {
    pub fn from_config(config: &ServiceConfig) -> Result<Self> {
        let http = &config.settings.http;
        let client = Client::builder()
            .user_agent(http.user_agent.as_str())
            .timeout(Duration::from_millis(http.request_timeout_ms))
            .build()
            .context("cannot build http client")?;
        let retry = RetrySettings::from(config.settings.retry.as_ref());

        let discovery = Arc::new(
            DiscoveryClient::new(
                client.clone(),
                &config.vendor.base_url,
                Duration::from_millis(http.discovery_timeout_ms),
            )
            .with_retry(retry.clone()),
        );

        let client_id = config.client.client_id.resolve().context("client.client_id")?;
        let key = config.client.key.resolve().context("client.key")?;
        let signer = KeySigner::new(client_id, &key, config.client.jku.clone(), config.client.kid.clone())?
            .with_ttl_minutes(config.client.assertion_ttl_minutes);

        let auth = Arc::new(
            Authenticator::new(client.clone(), discovery, signer, config.vendor.scopes.resolve())
                .with_safety_margin(config.settings.safety_margin_seconds()),
        );
        let manager = ExportJobManager::new(client.clone(), auth.clone(), &config.vendor.base_url)
            .with_default_retry_after(config.export.default_retry_after_seconds)
            .with_timeout_seconds(config.export.timeout_seconds)
            .with_retry(retry.clone());
        let downloader = ManifestDownloader::new(client, auth.clone()).with_retry(retry);

        Ok(Self {
            config: config.clone(),
            auth,
            manager,
            downloader,
            sink: NdjsonFileSink::from_config(&config.download),
        })
    }

    pub fn state_handle(&self) -> ExportStateHandle {
        self.manager.state_handle()
    }

    pub fn manager(&self) -> &ExportJobManager {
        &self.manager
    }

    pub fn sink(&self) -> &NdjsonFileSink {
        &self.sink
    }

    pub async fn run(&self, options: &RunOptions, cancel: &CancellationToken) -> Result<RunSummary> {
        let discovery = self.auth.discovery();
        match &self.config.vendor.smart_configuration {
            Some(configuration) => discovery.override_with(configuration.clone()).await,
            None => {
                discovery.fetch().await?;
            }
        }
        self.auth.authorize().await?;

        let job = self.job_for(options).await?;
        self.sink.write_job(&job).await?;

        let deadline = self.manager.default_deadline();
        let manifest = self.manager.wait_for_export_until(&job, deadline, cancel).await?;

        let concurrency = self.config.download.concurrency;
        let downloads = async {
            let output = self.downloader.download_manifest(&manifest, concurrency).await?;
            let errors = self.downloader.download_errors(&manifest, concurrency).await?;
            Ok::<_, BulkError>((output, errors))
        };
        let (output, errors) = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(BulkError::ExportCancelled { content_location: job.content_location.clone() }.into());
            }
            result = downloads => result?,
        };

        let records = count_records(&output);
        let error_records = count_records(&errors);
        if error_records > 0 {
            warn!(error_records, "export reported per-resource errors");
        }

        let mut batches = output;
        batches.extend(errors);
        let files = self.sink.write_batches(&batches).await?;
        info!(
            files = files.len(),
            records,
            "export written to {}",
            self.sink.dir().display()
        );

        Ok(RunSummary {
            job,
            transaction_time: manifest.transaction_time,
            files,
            records,
            error_records,
        })
    }

    async fn job_for(&self, options: &RunOptions) -> Result<ExportJob> {
        match &options.resume {
            Some(ResumeFrom::Url(url)) => Ok(self.manager.resume(url.as_str(), None)),
            Some(ResumeFrom::JobFile) => {
                let recorded = self.sink.read_job().await?.ok_or_else(|| {
                    anyhow!("no recorded export job at {}", self.sink.job_path().display())
                })?;
                Ok(self
                    .manager
                    .resume(recorded.content_location, Some(recorded.retry_after)))
            }
            None => {
                let group_id = options
                    .group_id
                    .as_deref()
                    .unwrap_or(&self.config.export.group_id);
                Ok(self
                    .manager
                    .start_export(group_id, &self.config.export.params)
                    .await?)
            }
        }
    }
}

fn count_records(batches: &[ResourceBatch]) -> usize {
    batches.iter().map(ResourceBatch::len).sum()
}
