use std::sync::Arc;

use http::header::ACCEPT;
use reqwest::{Client, StatusCode};
use tracing::{debug, info, warn};

use crate::cache::token::{AccessToken, TokenExpired, TokenResponse};
use crate::cache::token_cache::TokenCache;
use crate::config::settings::SAFETY_MARGIN_SECONDS_DEFAULT;
use crate::error::{snippet, BulkError, BulkResult};
use crate::helpers::time::{format_unix, get_instant, now_i64};
use crate::observability::metrics::{get_metrics, OUTCOME_ERROR, OUTCOME_OK};
use crate::sources::discovery::DiscoveryClient;
use crate::sources::request::{client_credentials_form, ACCEPT_ANY};
use crate::sources::signer::KeySigner;

/// Exchanges signed assertions for bearer tokens and keeps one fresh.
#[derive(Debug)]
pub struct Authenticator {
    client: Client,
    discovery: Arc<DiscoveryClient>,
    signer: KeySigner,
    scopes: Vec<String>,
    cache: TokenCache,
    safety_margin_seconds: u64,
}

impl Authenticator {
    pub fn new(
        client: Client,
        discovery: Arc<DiscoveryClient>,
        signer: KeySigner,
        scopes: Vec<String>,
    ) -> Self {
        Self {
            client,
            discovery,
            signer,
            scopes,
            cache: TokenCache::new(),
            safety_margin_seconds: SAFETY_MARGIN_SECONDS_DEFAULT,
        }
    }

    pub fn with_safety_margin(mut self, seconds: u64) -> Self {
        self.safety_margin_seconds = seconds;
        self
    }

    /// Share a token cache, e.g. between sessions of the same client.
    pub fn with_cache(mut self, cache: TokenCache) -> Self {
        self.cache = cache;
        self
    }

    pub fn cache(&self) -> &TokenCache {
        &self.cache
    }

    pub fn discovery(&self) -> &Arc<DiscoveryClient> {
        &self.discovery
    }

    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }

    /// Client-credentials exchange; always talks to the token endpoint.
    pub async fn authorize(&self) -> BulkResult<AccessToken> {
        let metrics = get_metrics().await;
        let token_endpoint = self.discovery.configuration().await?.token_endpoint;
        let assertion = self.signer.sign_for(&token_endpoint)?;
        let form = client_credentials_form(&assertion, &self.scopes);

        debug!(client_id = %self.signer.client_id(), "POST {}", token_endpoint);
        let start = get_instant();
        let response = self
            .client
            .post(&token_endpoint)
            .header(ACCEPT, ACCEPT_ANY)
            .form(&form)
            .send()
            .await
            .inspect_err(|_| {
                metrics.token_requests.with_label_values(&[OUTCOME_ERROR]).inc();
            })?;
        let status = response.status();
        let body = response.text().await?;
        metrics
            .request_duration
            .with_label_values(&["token"])
            .observe(start.elapsed().as_secs_f64());

        if status != StatusCode::OK {
            metrics.token_requests.with_label_values(&[OUTCOME_ERROR]).inc();
            warn!(status = status.as_u16(), "token exchange rejected: {}", snippet(&body));
            return Err(BulkError::Authorization {
                status: status.as_u16(),
                body: snippet(&body),
            });
        }

        let token = serde_json::from_str::<TokenResponse>(&body)
            .ok()
            .and_then(|parsed| AccessToken::from_response(parsed, now_i64()))
            .ok_or_else(|| {
                metrics.token_requests.with_label_values(&[OUTCOME_ERROR]).inc();
                BulkError::Authorization {
                    status: status.as_u16(),
                    body: format!("unusable token response: {}", snippet(&body)),
                }
            })?;

        let token = self.cache.set(token).await;
        metrics.token_requests.with_label_values(&[OUTCOME_OK]).inc();
        info!(
            expires_in = token.expires_in,
            scopes = token.scope.len(),
            "access token issued, valid until {}",
            format_unix(token.expires_at())
        );
        Ok(token)
    }

    /// Current token, re-authorizing only when it is missing or stale.
    /// Concurrent callers share a single refresh.
    pub async fn ensure_fresh(&self) -> BulkResult<AccessToken> {
        if let Some(token) = self.cache.get_fresh(now_i64(), self.safety_margin_seconds).await {
            return Ok(token);
        }

        let _guard = self.cache.refresh_guard().await;
        match self.current_token().await {
            Ok(token) => Ok(token),
            Err(TokenExpired) => {
                debug!("access token missing or stale, re-authorizing");
                self.authorize().await
            }
        }
    }

    async fn current_token(&self) -> Result<AccessToken, TokenExpired> {
        let token = self.cache.get().await.ok_or(TokenExpired)?;
        token.validate(now_i64(), self.safety_margin_seconds)?;
        Ok(token)
    }

    /// Bearer value for privileged requests.
    pub async fn bearer(&self) -> BulkResult<String> {
        Ok(self.ensure_fresh().await?.access_token)
    }
}
