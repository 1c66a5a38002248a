//! Wire constants and request builders shared by the vendor-facing clients.

use std::collections::BTreeMap;

use reqwest::Url;

use crate::error::{BulkError, BulkResult};

pub const SMART_CONFIGURATION_PATH: &str = ".well-known/smart-configuration";
pub const GRANT_TYPE_CLIENT_CREDENTIALS: &str = "client_credentials";
pub const CLIENT_ASSERTION_TYPE_JWT_BEARER: &str =
    "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

pub const PREFER_RESPOND_ASYNC: &str = "respond-async";
pub const ACCEPT_ANY: &str = "*/*";
pub const ACCEPT_FHIR_JSON: &str = "application/fhir+json";

pub const HEADER_PREFER: &str = "prefer";
pub const HEADER_X_PROGRESS: &str = "x-progress";

/// Base URLs are joined by concatenation, so they always end in '/'.
pub fn normalize_base_url(base_url: &str) -> String {
    if base_url.ends_with('/') {
        base_url.to_owned()
    } else {
        format!("{}/", base_url)
    }
}

pub fn smart_configuration_url(base_url: &str) -> String {
    format!("{}{}", normalize_base_url(base_url), SMART_CONFIGURATION_PATH)
}

/// `{base}Group/{id}/$export` with the optional kick-off parameters.
pub fn group_export_url(
    base_url: &str,
    group_id: &str,
    params: &BTreeMap<String, String>,
) -> BulkResult<Url> {
    let raw = format!("{}Group/{}/$export", normalize_base_url(base_url), group_id);
    let parsed = if params.is_empty() {
        Url::parse(&raw)
    } else {
        Url::parse_with_params(&raw, params.iter())
    };
    parsed.map_err(|e| BulkError::Configuration(format!("invalid export url '{}': {}", raw, e)))
}

/// Form body of the client-credentials grant with a JWT-bearer assertion.
pub fn client_credentials_form(assertion: &str, scopes: &[String]) -> Vec<(&'static str, String)> {
    vec![
        ("grant_type", GRANT_TYPE_CLIENT_CREDENTIALS.to_owned()),
        ("client_assertion", assertion.to_owned()),
        ("client_assertion_type", CLIENT_ASSERTION_TYPE_JWT_BEARER.to_owned()),
        ("scope", scopes.join(" ")),
    ]
}
