use serde::{Deserialize, Deserializer, Serialize};

/// `expires_in` assumed when the token endpoint omits it.
pub const DEFAULT_EXPIRES_IN_SECONDS: u64 = 300;

/// Internal signal raised by [`AccessToken::validate`]; consumed by the
/// authenticator's freshness guard and never returned to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenExpired;

/// Bearer token issued by the vendor's token endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessToken {
    pub access_token: String,
    pub scope: Vec<String>,
    /// ttl in seconds, always > 0
    pub expires_in: u64,
    pub token_type: String,
    /// unix seconds at which the exchange completed
    pub issued_at: i64,
}

/// Wire shape of a token endpoint response. Unknown keys are dropped.
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default, deserialize_with = "scope_list")]
    pub scope: Vec<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub token_type: Option<String>,
}

impl AccessToken {
    pub fn new(access_token: impl Into<String>, expires_in: u64, issued_at: i64) -> Self {
        Self {
            access_token: access_token.into(),
            scope: Vec::new(),
            expires_in,
            token_type: "bearer".to_owned(),
            issued_at,
        }
    }

    /// Build a token from a parsed response. `None` when the response carries
    /// a zero ttl, which would make the token stale on arrival.
    pub fn from_response(response: TokenResponse, issued_at: i64) -> Option<Self> {
        let expires_in = response.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECONDS);
        if expires_in == 0 {
            return None;
        }
        Some(Self {
            access_token: response.access_token,
            scope: response.scope,
            expires_in,
            token_type: response.token_type.unwrap_or_default(),
            issued_at,
        })
    }

    pub fn expires_at(&self) -> i64 {
        self.issued_at.saturating_add(self.expires_in as i64)
    }

    /// Stale once `issued_at + ttl < now + safety_margin`.
    pub fn is_stale(&self, now: i64, safety_margin_seconds: u64) -> bool {
        self.expires_at() < now.saturating_add(safety_margin_seconds as i64)
    }

    pub fn validate(&self, now: i64, safety_margin_seconds: u64) -> Result<(), TokenExpired> {
        if self.is_stale(now, safety_margin_seconds) {
            Err(TokenExpired)
        } else {
            Ok(())
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrArray {
    String(String),
    Array(Vec<String>),
}

// vendors send either "a b c" or ["a", "b", "c"]
fn scope_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<StringOrArray>::deserialize(deserializer)?;
    Ok(match raw {
        Some(StringOrArray::String(s)) => s.split_whitespace().map(str::to_owned).collect(),
        Some(StringOrArray::Array(items)) => items,
        None => Vec::new(),
    })
}
