use tokio::time::{sleep, Duration};
use tracing::{error, warn};

use crate::config::settings::RetryConfig;
use crate::error::BulkError;

/// Bounded exponential backoff for transient vendor failures.
#[derive(Debug, Clone)]
pub struct RetrySettings {
    pub attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 1000,
        }
    }
}

impl From<Option<&RetryConfig>> for RetrySettings {
    fn from(retry: Option<&RetryConfig>) -> Self {
        let defaults = RetrySettings::default();
        Self {
            attempts: retry.and_then(|r| r.attempts).unwrap_or(defaults.attempts).max(1),
            base_delay_ms: retry.and_then(|r| r.base_delay_ms).unwrap_or(defaults.base_delay_ms),
            max_delay_ms: retry.and_then(|r| r.max_delay_ms).unwrap_or(defaults.max_delay_ms),
        }
    }
}

impl RetrySettings {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(20);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }

    /// Run `operation`, retrying only errors for which [`BulkError::is_transient`] holds.
    pub async fn run_with_retry<F, Fut, T>(&self, what: &str, mut operation: F) -> Result<T, BulkError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, BulkError>>,
    {
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.attempts => {
                    warn!("{what}: attempt {attempt}/{} failed: {e}", self.attempts);
                    sleep(self.delay_for(attempt)).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_transient() {
                        error!("{what}: all {attempt} attempts failed: {e}");
                    }
                    return Err(e);
                }
            }
        }
    }
}
