use thiserror::Error;

/// Longest slice of a vendor response body kept in an error.
const BODY_SNIPPET_LEN: usize = 512;

pub type BulkResult<T> = Result<T, BulkError>;

/// Every failure the bulk export workflow can surface to a caller.
#[derive(Debug, Error)]
pub enum BulkError {
    /// Discovery has not run, or the configuration is unusable.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("smart configuration discovery failed for '{url}': {reason}")]
    Discovery { url: String, reason: String },

    #[error("signing error: {0}")]
    Signing(String),

    #[error("authorization failed with status {status}: {body}")]
    Authorization { status: u16, body: String },

    #[error("export start failed with status {status}: {body} (headers: {headers})")]
    ExportStart {
        status: u16,
        headers: String,
        body: String,
    },

    #[error("export at '{content_location}' did not complete within {waited_secs}s")]
    ExportTimeout {
        content_location: String,
        waited_secs: u64,
    },

    #[error("waiting for export at '{content_location}' was cancelled")]
    ExportCancelled { content_location: String },

    #[error("malformed manifest from '{url}': {reason}")]
    ManifestDecode { url: String, reason: String },

    #[error("malformed ndjson in '{url}' at line {line_index}: {reason}")]
    ManifestParse {
        url: String,
        line_index: usize,
        reason: String,
    },

    #[error("download of '{url}' failed with status {status}: {body}")]
    Download {
        url: String,
        status: u16,
        body: String,
    },

    #[error("background task failed: {0}")]
    TaskFailed(String),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("sink error: {0}")]
    Sink(#[from] std::io::Error),
}

impl BulkError {
    /// Errors worth another attempt: network failures and 5xx responses.
    pub fn is_transient(&self) -> bool {
        match self {
            BulkError::Transport(_) => true,
            BulkError::Download { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Trim a response body to a bounded diagnostic snippet.
pub fn snippet(body: &str) -> String {
    if body.len() <= BODY_SNIPPET_LEN {
        return body.to_owned();
    }
    let mut end = BODY_SNIPPET_LEN;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}

/// Render response headers for diagnostics, without credentials.
pub fn headers_snippet(headers: &http::HeaderMap) -> String {
    let rendered = headers
        .iter()
        .filter(|(name, _)| *name != http::header::AUTHORIZATION && *name != http::header::SET_COOKIE)
        .map(|(name, value)| format!("{}: {}", name, value.to_str().unwrap_or("<binary>")))
        .collect::<Vec<_>>()
        .join(", ");
    snippet(&rendered)
}
