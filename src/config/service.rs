use serde::Deserialize;
use std::collections::BTreeMap;
use std::{env, fs};

use anyhow::{anyhow, Result};

use crate::config::scopes::ScopeSet;
use crate::config::settings::SettingsConfig;
use crate::sources::discovery::SmartConfiguration;

pub const EXPORT_TIMEOUT_SECONDS_DEFAULT: u64 = 600;
pub const RETRY_AFTER_SECONDS_DEFAULT: u64 = 120;
pub const ASSERTION_TTL_MINUTES_DEFAULT: u64 = 5;
pub const DOWNLOAD_CONCURRENCY_DEFAULT: usize = 4;

/// ================================
/// Full service configuration
/// ================================
#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    #[serde(default)]
    pub settings: SettingsConfig,
    pub vendor: VendorConfig,
    pub client: ClientConfig,
    pub export: ExportConfig,
    #[serde(default)]
    pub download: DownloadConfig,
}

/// ================================
/// Vendor (EHR) endpoints
/// ================================
#[derive(Debug, Deserialize, Clone)]
pub struct VendorConfig {
    /// FHIR base, e.g. https://fhir.epic.com/interconnect-fhir-oauth/api/FHIR/R4/
    pub base_url: String,
    #[serde(default)]
    pub scopes: ScopeSet,
    /// replaces the discovered document; some vendors publish wrong endpoints
    pub smart_configuration: Option<SmartConfiguration>,
}

/// ================================
/// Registered backend client
/// ================================
#[derive(Debug, Deserialize, Clone)]
pub struct ClientConfig {
    pub client_id: SecretValue,
    /// JWK Set URL placed in the assertion header
    pub jku: Option<String>,
    pub kid: Option<String>,
    /// PEM or private JWK json
    pub key: SecretValue,
    #[serde(default = "default_assertion_ttl_minutes")]
    pub assertion_ttl_minutes: u64,
}

/// Value sources for identity and key material
#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
pub enum SecretValue {
    Literal { value: String },
    FromEnv { from_env: String },
    FromFile { path: String },
}

impl SecretValue {
    pub fn resolve(&self) -> Result<String> {
        match self {
            SecretValue::Literal { value } => Ok(value.to_owned()),
            SecretValue::FromEnv { from_env } => env::var(from_env)
                .map_err(|err| anyhow!("env var '{}' unavailable: {}", from_env, err)),
            SecretValue::FromFile { path } => fs::read_to_string(path)
                .map(|content| content.trim().to_string())
                .map_err(|err| anyhow!("cannot read '{}': {}", path, err)),
        }
    }
}

/// ================================
/// Export request
/// ================================
#[derive(Debug, Deserialize, Clone)]
pub struct ExportConfig {
    pub group_id: String,
    /// query parameters such as _type, _since, _outputFormat
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default = "default_export_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_retry_after_seconds")]
    pub default_retry_after_seconds: u64,
}

/// ================================
/// Download + persistence
/// ================================
#[derive(Debug, Deserialize, Clone)]
pub struct DownloadConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
    #[serde(default)]
    pub file_prefix: String,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            output_dir: default_output_dir(),
            file_prefix: String::new(),
        }
    }
}

fn default_assertion_ttl_minutes() -> u64 {
    ASSERTION_TTL_MINUTES_DEFAULT
}

fn default_export_timeout_seconds() -> u64 {
    EXPORT_TIMEOUT_SECONDS_DEFAULT
}

fn default_retry_after_seconds() -> u64 {
    RETRY_AFTER_SECONDS_DEFAULT
}

fn default_concurrency() -> usize {
    DOWNLOAD_CONCURRENCY_DEFAULT
}

fn default_output_dir() -> String {
    "data".to_owned()
}
