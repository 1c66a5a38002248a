use std::sync::Arc;

use http::header::ACCEPT;
use reqwest::Client;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::{snippet, BulkError, BulkResult};
use crate::helpers::time::get_instant;
use crate::observability::metrics::{get_metrics, OUTCOME_ERROR, OUTCOME_OK};
use crate::resilience::retry::RetrySettings;
use crate::sources::authenticator::Authenticator;
use crate::sources::manifest::{Manifest, OutputFile};
use crate::sources::request::ACCEPT_ANY;

/// Parsed content of one exported file.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceBatch {
    /// records in file order
    pub content: Vec<Value>,
    pub resource_type: String,
    pub url: String,
}

impl ResourceBatch {
    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}

/// Every non-empty line must be a JSON object. One bad line fails the
/// whole body; `line_index` is zero-based.
pub fn parse_ndjson(body: &str, url: &str) -> BulkResult<Vec<Value>> {
    body.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(line_index, line)| {
            let parse_error = |reason: String| BulkError::ManifestParse {
                url: url.to_owned(),
                line_index,
                reason,
            };
            match serde_json::from_str::<Value>(line) {
                Ok(record @ Value::Object(_)) => Ok(record),
                Ok(_) => Err(parse_error("expected a json object".to_owned())),
                Err(e) => Err(parse_error(e.to_string())),
            }
        })
        .collect()
}

/// Downloads the files listed in a manifest.
#[derive(Debug, Clone)]
pub struct ManifestDownloader {
    client: Client,
    auth: Arc<Authenticator>,
    retry: RetrySettings,
}

impl ManifestDownloader {
    pub fn new(client: Client, auth: Arc<Authenticator>) -> Self {
        Self {
            client,
            auth,
            retry: RetrySettings::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetrySettings) -> Self {
        self.retry = retry;
        self
    }

    pub async fn download(&self, file: &OutputFile) -> BulkResult<ResourceBatch> {
        self.fetch(file, true).await
    }

    /// For manifests with `requiresAccessToken: false`; sends no credentials.
    pub async fn download_without_token(&self, file: &OutputFile) -> BulkResult<ResourceBatch> {
        self.fetch(file, false).await
    }

    async fn fetch(&self, file: &OutputFile, with_token: bool) -> BulkResult<ResourceBatch> {
        let metrics = get_metrics().await;
        let start = get_instant();
        let result = self
            .retry
            .run_with_retry(&file.url, || self.fetch_once(file, with_token))
            .await
            .and_then(|body| parse_ndjson(&body, &file.url));
        metrics
            .request_duration
            .with_label_values(&["download"])
            .observe(start.elapsed().as_secs_f64());

        let content = match result {
            Ok(content) => content,
            Err(err) => {
                metrics
                    .download_files
                    .with_label_values(&[file.resource_type.as_str(), OUTCOME_ERROR])
                    .inc();
                warn!(resource_type = %file.resource_type, "download failed: {}", err);
                return Err(err);
            }
        };

        metrics
            .download_files
            .with_label_values(&[file.resource_type.as_str(), OUTCOME_OK])
            .inc();
        metrics
            .download_records
            .with_label_values(&[file.resource_type.as_str()])
            .inc_by(content.len() as u64);
        if let Some(expected) = file.count.filter(|expected| *expected != content.len() as u64) {
            warn!(
                resource_type = %file.resource_type,
                expected,
                actual = content.len(),
                "record count differs from manifest: {}", file.url
            );
        }
        info!(resource_type = %file.resource_type, records = content.len(), "downloaded {}", file.url);

        Ok(ResourceBatch {
            content,
            resource_type: file.resource_type.clone(),
            url: file.url.clone(),
        })
    }

    async fn fetch_once(&self, file: &OutputFile, with_token: bool) -> BulkResult<String> {
        let mut request = self.client.get(&file.url).header(ACCEPT, ACCEPT_ANY);
        if with_token {
            let token = self.auth.ensure_fresh().await?;
            request = request.bearer_auth(token.access_token);
        }
        debug!("GET {}", file.url);
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(BulkError::Download {
                url: file.url.clone(),
                status: status.as_u16(),
                body: snippet(&body),
            });
        }
        Ok(body)
    }

    /// Fan `files` out over at most `concurrency` tasks. The first failure
    /// aborts the remaining downloads; batches keep the order of `files`.
    pub async fn download_all(
        &self,
        files: &[OutputFile],
        with_token: bool,
        concurrency: usize,
    ) -> BulkResult<Vec<ResourceBatch>> {
        let permits = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut tasks = JoinSet::new();
        for (index, file) in files.iter().cloned().enumerate() {
            let downloader = self.clone();
            let permits = permits.clone();
            tasks.spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|e| BulkError::TaskFailed(e.to_string()))?;
                downloader
                    .fetch(&file, with_token)
                    .await
                    .map(|batch| (index, batch))
            });
        }

        let mut batches: Vec<Option<ResourceBatch>> = vec![None; files.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok((index, batch))) => batches[index] = Some(batch),
                Ok(Err(err)) => {
                    tasks.abort_all();
                    return Err(err);
                }
                Err(join_error) => {
                    tasks.abort_all();
                    return Err(BulkError::TaskFailed(join_error.to_string()));
                }
            }
        }
        Ok(batches.into_iter().flatten().collect())
    }

    /// Every output file of `manifest`, honoring `requiresAccessToken`.
    pub async fn download_manifest(
        &self,
        manifest: &Manifest,
        concurrency: usize,
    ) -> BulkResult<Vec<ResourceBatch>> {
        info!(
            files = manifest.output.len(),
            concurrency,
            types = ?manifest.resource_types(),
            "downloading export output"
        );
        self.download_all(&manifest.output, manifest.needs_access_token(), concurrency)
            .await
    }

    /// OperationOutcome files listed under `error`.
    pub async fn download_errors(
        &self,
        manifest: &Manifest,
        concurrency: usize,
    ) -> BulkResult<Vec<ResourceBatch>> {
        self.download_all(manifest.error_files(), manifest.needs_access_token(), concurrency)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_objects_and_skips_blank_lines() {
        let body = "{\"resourceType\":\"Patient\",\"id\":\"1\"}\n\n{\"resourceType\":\"Patient\",\"id\":\"2\"}\n";
        let records = parse_ndjson(body, "u").unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1]["id"], "2");
    }

    #[test]
    fn empty_body_is_an_empty_batch() {
        assert!(parse_ndjson("", "u").unwrap().is_empty());
        assert!(parse_ndjson("\n  \n", "u").unwrap().is_empty());
    }

    #[test]
    fn bad_line_names_its_zero_based_index() {
        let body = "{\"id\":\"1\"}\n{\"id\":\"2\"}\nnot json\n{\"id\":\"4\"}";
        let err = parse_ndjson(body, "https://x/p.ndjson").unwrap_err();
        match err {
            BulkError::ManifestParse { url, line_index, .. } => {
                assert_eq!(url, "https://x/p.ndjson");
                assert_eq!(line_index, 2);
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn non_object_lines_are_rejected() {
        let err = parse_ndjson("{\"id\":1}\n[1,2]", "u").unwrap_err();
        assert!(matches!(err, BulkError::ManifestParse { line_index: 1, .. }));
    }

    #[test]
    fn crlf_line_endings_are_accepted() {
        let records = parse_ndjson("{\"id\":1}\r\n{\"id\":2}\r\n", "u").unwrap();
        assert_eq!(records.len(), 2);
    }
}
