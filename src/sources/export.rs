//! Bulk export kick-off and the poll loop that drives a job to completion.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use http::header::{ACCEPT, CONTENT_LOCATION, RETRY_AFTER};
use http::HeaderMap;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::service::{EXPORT_TIMEOUT_SECONDS_DEFAULT, RETRY_AFTER_SECONDS_DEFAULT};
use crate::error::{headers_snippet, snippet, BulkError, BulkResult};
use crate::helpers::time::{deadline_in, get_instant};
use crate::observability::metrics::{get_metrics, OUTCOME_ERROR, OUTCOME_OK};
use crate::resilience::retry::RetrySettings;
use crate::sources::authenticator::Authenticator;
use crate::sources::manifest::Manifest;
use crate::sources::request::{
    group_export_url, normalize_base_url, ACCEPT_ANY, ACCEPT_FHIR_JSON, HEADER_PREFER,
    HEADER_X_PROGRESS, PREFER_RESPOND_ASYNC,
};

/// Floor for server-dictated poll intervals, so `Retry-After: 0` cannot spin.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Handle of an accepted export. The poll URL is its identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportJob {
    pub content_location: String,
    /// seconds between polls
    pub retry_after: u64,
}

impl ExportJob {
    pub fn new(content_location: impl Into<String>, retry_after: u64) -> Self {
        Self {
            content_location: content_location.into(),
            retry_after,
        }
    }

    /// `None` when the response carries no usable `Content-Location`.
    pub fn from_headers(headers: &HeaderMap, default_retry_after: u64) -> Option<Self> {
        let content_location = headers
            .get(CONTENT_LOCATION)?
            .to_str()
            .ok()
            .map(str::trim)
            .filter(|value| !value.is_empty())?;
        Some(Self::new(
            content_location,
            parse_retry_after(headers, default_retry_after),
        ))
    }
}

/// Numeric `Retry-After` seconds, if present.
pub fn retry_after_header(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
}

/// `Retry-After` seconds, or `default` when absent or not numeric.
pub fn parse_retry_after(headers: &HeaderMap, default: u64) -> u64 {
    retry_after_header(headers).unwrap_or(default)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ExportState {
    #[default]
    NotStarted,
    Requested {
        group_id: String,
    },
    Polling {
        job: ExportJob,
        polls: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        progress: Option<String>,
    },
    Completed {
        job: ExportJob,
        outputs: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transaction_time: Option<String>,
    },
    Failed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        job: Option<ExportJob>,
        reason: String,
    },
    TimedOut {
        job: ExportJob,
    },
    Cancelled {
        job: ExportJob,
    },
}

impl ExportState {
    /// Value of the `export_state` gauge.
    pub fn code(&self) -> i64 {
        match self {
            ExportState::NotStarted => 0,
            ExportState::Requested { .. } => 1,
            ExportState::Polling { .. } => 2,
            ExportState::Completed { .. } => 3,
            ExportState::Failed { .. } => 4,
            ExportState::TimedOut { .. } => 5,
            ExportState::Cancelled { .. } => 6,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ExportState::NotStarted => "not_started",
            ExportState::Requested { .. } => "requested",
            ExportState::Polling { .. } => "polling",
            ExportState::Completed { .. } => "completed",
            ExportState::Failed { .. } => "failed",
            ExportState::TimedOut { .. } => "timed_out",
            ExportState::Cancelled { .. } => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExportState::Completed { .. }
                | ExportState::Failed { .. }
                | ExportState::TimedOut { .. }
                | ExportState::Cancelled { .. }
        )
    }

    /// Edges of the lifecycle graph. A terminal state may start over,
    /// and `NotStarted -> Polling` is a resumed job.
    pub fn can_transition_to(&self, next: &ExportState) -> bool {
        use ExportState::*;
        match (self, next) {
            (NotStarted, Requested { .. } | Polling { .. }) => true,
            (Requested { .. }, Polling { .. } | Failed { .. }) => true,
            (
                Polling { .. },
                Polling { .. } | Completed { .. } | Failed { .. } | TimedOut { .. } | Cancelled { .. },
            ) => true,
            (current, Requested { .. } | Polling { .. }) => current.is_terminal(),
            _ => false,
        }
    }
}

pub type ExportStateHandle = Arc<RwLock<ExportState>>;

/// Called with the raw `X-Progress` value whenever a poll reports one.
pub type ProgressHook = Arc<dyn Fn(&ExportJob, &str) + Send + Sync>;

/// How a poll response moves the loop forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollClass {
    Complete,
    InProgress,
    Transient,
}

impl PollClass {
    fn label(self) -> &'static str {
        match self {
            PollClass::Complete => "complete",
            PollClass::InProgress => "in_progress",
            PollClass::Transient => "transient",
        }
    }
}

pub fn classify(status: StatusCode) -> PollClass {
    if status == StatusCode::OK {
        PollClass::Complete
    } else if status.is_server_error() {
        PollClass::Transient
    } else {
        PollClass::InProgress
    }
}

fn poll_interval(job: &ExportJob) -> Duration {
    Duration::from_secs(job.retry_after).max(MIN_POLL_INTERVAL)
}

struct PollResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: String,
}

/// Starts group exports and waits for them. Cheap to clone; clones share
/// the authenticator and the state handle.
#[derive(Clone)]
pub struct ExportJobManager {
    client: Client,
    auth: Arc<Authenticator>,
    base_url: String,
    default_retry_after: u64,
    timeout_seconds: u64,
    retry: RetrySettings,
    state: ExportStateHandle,
    progress_hook: Option<ProgressHook>,
}

impl ExportJobManager {
    pub fn new(client: Client, auth: Arc<Authenticator>, base_url: &str) -> Self {
        Self {
            client,
            auth,
            base_url: normalize_base_url(base_url),
            default_retry_after: RETRY_AFTER_SECONDS_DEFAULT,
            timeout_seconds: EXPORT_TIMEOUT_SECONDS_DEFAULT,
            retry: RetrySettings::default(),
            state: ExportStateHandle::default(),
            progress_hook: None,
        }
    }

    pub fn with_default_retry_after(mut self, seconds: u64) -> Self {
        self.default_retry_after = seconds;
        self
    }

    pub fn with_timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    pub fn with_retry(mut self, retry: RetrySettings) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_progress_hook(mut self, hook: ProgressHook) -> Self {
        self.progress_hook = Some(hook);
        self
    }

    pub fn state_handle(&self) -> ExportStateHandle {
        self.state.clone()
    }

    pub async fn state(&self) -> ExportState {
        self.state.read().await.clone()
    }

    pub fn default_deadline(&self) -> Instant {
        deadline_in(self.timeout_seconds)
    }

    /// Kick off `Group/{id}/$export`. Not retried: a repeated kick-off
    /// would start a second job on the vendor side.
    pub async fn start_export(
        &self,
        group_id: &str,
        params: &BTreeMap<String, String>,
    ) -> BulkResult<ExportJob> {
        let metrics = get_metrics().await;
        let url = group_export_url(&self.base_url, group_id, params)?;
        let token = self.auth.ensure_fresh().await?;
        self.transition(ExportState::Requested {
            group_id: group_id.to_owned(),
        })
        .await;

        info!(group_id, "starting bulk export: GET {}", url);
        let start = get_instant();
        let sent = self
            .client
            .get(url)
            .bearer_auth(&token.access_token)
            .header(HEADER_PREFER, PREFER_RESPOND_ASYNC)
            .header(ACCEPT, ACCEPT_FHIR_JSON)
            .send()
            .await;
        let response = match sent {
            Ok(response) => response,
            Err(err) => {
                metrics.export_starts.with_label_values(&[OUTCOME_ERROR]).inc();
                self.fail(None, err.to_string()).await;
                return Err(err.into());
            }
        };
        let status = response.status();
        let headers = response.headers().clone();
        let body = match response.text().await {
            Ok(body) => body,
            Err(err) => {
                metrics.export_starts.with_label_values(&[OUTCOME_ERROR]).inc();
                self.fail(None, err.to_string()).await;
                return Err(err.into());
            }
        };
        metrics
            .request_duration
            .with_label_values(&["export_start"])
            .observe(start.elapsed().as_secs_f64());

        if status != StatusCode::ACCEPTED {
            metrics.export_starts.with_label_values(&[OUTCOME_ERROR]).inc();
            let err = BulkError::ExportStart {
                status: status.as_u16(),
                headers: headers_snippet(&headers),
                body: snippet(&body),
            };
            error!("{}", err);
            self.fail(None, err.to_string()).await;
            return Err(err);
        }

        let Some(job) = ExportJob::from_headers(&headers, self.default_retry_after) else {
            metrics.export_starts.with_label_values(&[OUTCOME_ERROR]).inc();
            let err = BulkError::ExportStart {
                status: status.as_u16(),
                headers: headers_snippet(&headers),
                body: "accepted without a Content-Location header".to_owned(),
            };
            error!("{}", err);
            self.fail(None, err.to_string()).await;
            return Err(err);
        };

        metrics.export_starts.with_label_values(&[OUTCOME_OK]).inc();
        info!(
            retry_after = job.retry_after,
            "export accepted, poll at {}", job.content_location
        );
        Ok(job)
    }

    /// Handle for a job started earlier, e.g. by a previous process.
    pub fn resume(&self, content_location: impl Into<String>, retry_after: Option<u64>) -> ExportJob {
        let job = ExportJob::new(
            content_location,
            retry_after.unwrap_or(self.default_retry_after),
        );
        info!("resuming export at {}", job.content_location);
        job
    }

    pub async fn wait_for_export(&self, job: &ExportJob, deadline: Instant) -> BulkResult<Manifest> {
        self.wait_for_export_until(job, deadline, &CancellationToken::new())
            .await
    }

    /// Poll until the manifest arrives, `deadline` passes or `cancel` fires.
    pub async fn wait_for_export_until(
        &self,
        job: &ExportJob,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> BulkResult<Manifest> {
        let metrics = get_metrics().await;
        let mut job = job.clone();
        let started = get_instant();
        let mut polls: u32 = 0;
        let mut transient_failures: u32 = 0;
        self.transition(ExportState::Polling {
            job: job.clone(),
            polls,
            progress: None,
        })
        .await;

        loop {
            if Instant::now() >= deadline {
                return Err(self.timed_out(&job, started).await);
            }
            if cancel.is_cancelled() {
                return Err(self.cancelled(&job).await);
            }

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(self.cancelled(&job).await),
                _ = sleep_until(deadline) => return Err(self.timed_out(&job, started).await),
                outcome = self.poll_once(&job) => outcome,
            };
            polls += 1;

            let wait = match outcome {
                Ok(response) => {
                    let progress = self.report_progress(&job, &response.headers);
                    let class = classify(response.status);
                    metrics.export_polls.with_label_values(&[class.label()]).inc();
                    debug!(status = response.status.as_u16(), class = class.label(), polls, "export poll");

                    if class == PollClass::Complete {
                        return self.complete(&job, &response.body).await;
                    }
                    job.retry_after = parse_retry_after(&response.headers, job.retry_after);
                    self.transition(ExportState::Polling {
                        job: job.clone(),
                        polls,
                        progress,
                    })
                    .await;
                    if class == PollClass::Transient {
                        transient_failures += 1;
                        warn!(
                            status = response.status.as_u16(),
                            "export poll failed ({} in a row), polling again",
                            transient_failures
                        );
                        self.transient_wait(&job, transient_failures)
                    } else {
                        transient_failures = 0;
                        poll_interval(&job)
                    }
                }
                Err(err) if err.is_transient() => {
                    metrics.export_polls.with_label_values(&[OUTCOME_ERROR]).inc();
                    transient_failures += 1;
                    warn!("export poll failed ({} in a row): {}", transient_failures, err);
                    self.transient_wait(&job, transient_failures)
                }
                Err(err) => {
                    metrics.export_polls.with_label_values(&[OUTCOME_ERROR]).inc();
                    error!("export poll failed: {}", err);
                    self.fail(Some(&job), err.to_string()).await;
                    return Err(err);
                }
            };

            let wake = Instant::now().checked_add(wait).map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(self.cancelled(&job).await),
                _ = sleep_until(wake) => {}
            }
        }
    }

    /// Backoff after consecutive failed polls, never shorter than the
    /// job's own poll interval. Only the deadline ends a failing job.
    fn transient_wait(&self, job: &ExportJob, failures: u32) -> Duration {
        poll_interval(job).max(self.retry.delay_for(failures))
    }

    async fn poll_once(&self, job: &ExportJob) -> BulkResult<PollResponse> {
        let token = self.auth.ensure_fresh().await?;
        debug!("GET {}", job.content_location);
        let start = get_instant();
        let response = self
            .client
            .get(&job.content_location)
            .bearer_auth(&token.access_token)
            .header(HEADER_PREFER, PREFER_RESPOND_ASYNC)
            .header(ACCEPT, ACCEPT_ANY)
            .send()
            .await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await?;
        get_metrics()
            .await
            .request_duration
            .with_label_values(&["export_poll"])
            .observe(start.elapsed().as_secs_f64());
        Ok(PollResponse { status, headers, body })
    }

    fn report_progress(&self, job: &ExportJob, headers: &HeaderMap) -> Option<String> {
        let progress = headers
            .get(HEADER_X_PROGRESS)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned)?;
        info!(progress = %progress, "export in progress");
        if let Some(hook) = &self.progress_hook {
            hook(job, &progress);
        }
        Some(progress)
    }

    async fn complete(&self, job: &ExportJob, body: &str) -> BulkResult<Manifest> {
        let manifest = match Manifest::from_json(body, &job.content_location) {
            Ok(manifest) => manifest,
            Err(err) => {
                error!("{}", err);
                self.fail(Some(job), err.to_string()).await;
                return Err(err);
            }
        };
        info!(
            outputs = manifest.output.len(),
            errors = manifest.error_files().len(),
            "export complete"
        );
        self.transition(ExportState::Completed {
            job: job.clone(),
            outputs: manifest.output.len(),
            transaction_time: manifest.transaction_time.clone(),
        })
        .await;
        Ok(manifest)
    }

    async fn timed_out(&self, job: &ExportJob, started: Instant) -> BulkError {
        let err = BulkError::ExportTimeout {
            content_location: job.content_location.clone(),
            waited_secs: started.elapsed().as_secs(),
        };
        error!("{}", err);
        self.transition(ExportState::TimedOut { job: job.clone() }).await;
        err
    }

    async fn cancelled(&self, job: &ExportJob) -> BulkError {
        warn!("export wait cancelled, job can be resumed from {}", job.content_location);
        self.transition(ExportState::Cancelled { job: job.clone() }).await;
        BulkError::ExportCancelled {
            content_location: job.content_location.clone(),
        }
    }

    async fn fail(&self, job: Option<&ExportJob>, reason: String) {
        self.transition(ExportState::Failed {
            job: job.cloned(),
            reason,
        })
        .await;
    }

    async fn transition(&self, next: ExportState) {
        let mut state = self.state.write().await;
        if !state.can_transition_to(&next) {
            warn!(from = state.name(), to = next.name(), "unexpected export state transition");
        } else if state.name() != next.name() {
            info!(from = state.name(), to = next.name(), "export state changed");
        }
        get_metrics().await.export_state.set(next.code());
        *state = next;
    }
}
