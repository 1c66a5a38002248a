use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard, RwLock};

use crate::cache::token::AccessToken;

/// Holder of the session's current bearer token.
///
/// Read-mostly: readers clone the token out, a refresh replaces it wholesale.
/// `refresh_guard` serialises refreshes so concurrent callers that all see a
/// stale token trigger a single exchange.
#[derive(Debug, Clone, Default)]
pub struct TokenCache {
    inner: Arc<RwLock<Option<AccessToken>>>,
    refresh: Arc<Mutex<()>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self) -> Option<AccessToken> {
        self.inner.read().await.clone()
    }

    /// Token if present and valid for at least `safety_margin_seconds` more.
    pub async fn get_fresh(&self, now: i64, safety_margin_seconds: u64) -> Option<AccessToken> {
        self.inner
            .read()
            .await
            .as_ref()
            .filter(|token| token.validate(now, safety_margin_seconds).is_ok())
            .cloned()
    }

    /// Replace the current token. `issued_at` never moves backwards.
    pub async fn set(&self, mut token: AccessToken) -> AccessToken {
        let mut slot = self.inner.write().await;
        if let Some(previous) = slot.as_ref() {
            token.issued_at = token.issued_at.max(previous.issued_at);
        }
        *slot = Some(token.clone());
        token
    }

    pub async fn clear(&self) {
        *self.inner.write().await = None;
    }

    pub async fn refresh_guard(&self) -> MutexGuard<'_, ()> {
        self.refresh.lock().await
    }
}
