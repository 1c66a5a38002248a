//! Configuration validation with aggregated errors.
//! Every issue is collected so one run reports the whole list.

use tracing::{error, info};

use crate::config::service::{DownloadConfig, ExportConfig, ServiceConfig, VendorConfig};
use crate::config::settings::{RetryConfig, SettingsConfig};

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];
const MAX_ASSERTION_TTL_MINUTES: u64 = 60;
const MAX_EXPORT_TIMEOUT_SECONDS: u64 = 7 * 24 * 3600;

/// Public entrypoint: returns Ok(()) or Err(Vec<String>) containing all issues.
pub fn validate_service_config(cfg: &ServiceConfig) -> Result<(), Vec<String>> {
    let mut errors: Vec<String> = Vec::new();

    validate_settings(&cfg.settings, &mut errors);
    validate_vendor(&cfg.vendor, &mut errors);
    validate_export(&cfg.export, &mut errors);
    validate_download(&cfg.download, &mut errors);

    if cfg.client.assertion_ttl_minutes == 0 || cfg.client.assertion_ttl_minutes > MAX_ASSERTION_TTL_MINUTES {
        errors.push(format!(
            "client.assertion_ttl_minutes must be within 1..={}",
            MAX_ASSERTION_TTL_MINUTES
        ));
    }
    if let Some(jku) = &cfg.client.jku {
        if !is_http_url(jku) {
            errors.push(format!("client.jku '{}' must be an http(s) url", jku));
        }
    }

    if errors.is_empty() {
        info!("config validation passed");
        Ok(())
    } else {
        for e in &errors {
            error!("config: {}", e);
        }
        Err(errors)
    }
}

fn validate_settings(settings: &SettingsConfig, errors: &mut Vec<String>) {
    if let Some(logging) = &settings.logging {
        if !LOG_LEVELS.contains(&logging.level.to_lowercase().as_str()) {
            errors.push(format!(
                "settings.logging.level '{}' must be one of {:?}",
                logging.level, LOG_LEVELS
            ));
        }
    }
    if let Some(retry) = &settings.retry {
        validate_retry(retry, errors);
    }
    if settings.http.discovery_timeout_ms == 0 {
        errors.push("settings.http.discovery_timeout_ms must be > 0".to_string());
    }
    if settings.http.request_timeout_ms == 0 {
        errors.push("settings.http.request_timeout_ms must be > 0".to_string());
    }
    if settings.metrics.is_enabled && !settings.metrics.path.starts_with('/') {
        errors.push(format!(
            "settings.metrics.path '{}' must start with '/'",
            settings.metrics.path
        ));
    }
    if let Some(server) = &settings.server {
        if server.port.parse::<u16>().is_err() {
            errors.push(format!("settings.server.port '{}' is not a valid port", server.port));
        }
    }
}

fn validate_retry(retry: &RetryConfig, errors: &mut Vec<String>) {
    if retry.attempts == Some(0) {
        errors.push("settings.retry.attempts must be >= 1".to_string());
    }
    if let (Some(base), Some(max)) = (retry.base_delay_ms, retry.max_delay_ms) {
        if max < base {
            errors.push(format!(
                "settings.retry.max_delay_ms ({}) must be >= base_delay_ms ({})",
                max, base
            ));
        }
    }
}

fn validate_vendor(vendor: &VendorConfig, errors: &mut Vec<String>) {
    if !is_http_url(&vendor.base_url) {
        errors.push(format!(
            "vendor.base_url '{}' must be an http(s) url",
            vendor.base_url
        ));
    }
    if vendor.scopes.resolve().is_empty() {
        errors.push("vendor.scopes resolves to an empty list".to_string());
    }
    if let Some(smart) = &vendor.smart_configuration {
        if !is_http_url(&smart.token_endpoint) {
            errors.push(format!(
                "vendor.smart_configuration.token_endpoint '{}' must be an http(s) url",
                smart.token_endpoint
            ));
        }
    }
}

fn validate_export(export: &ExportConfig, errors: &mut Vec<String>) {
    if export.group_id.trim().is_empty() {
        errors.push("export.group_id must not be empty".to_string());
    }
    if export.group_id.contains('/') {
        errors.push(format!("export.group_id '{}' must not contain '/'", export.group_id));
    }
    if export.timeout_seconds == 0 || export.timeout_seconds > MAX_EXPORT_TIMEOUT_SECONDS {
        errors.push(format!(
            "export.timeout_seconds must be within 1..={}",
            MAX_EXPORT_TIMEOUT_SECONDS
        ));
    }
    if export.default_retry_after_seconds == 0 {
        errors.push("export.default_retry_after_seconds must be > 0".to_string());
    }
}

fn validate_download(download: &DownloadConfig, errors: &mut Vec<String>) {
    if download.concurrency == 0 {
        errors.push("download.concurrency must be >= 1".to_string());
    }
    if download.output_dir.trim().is_empty() {
        errors.push("download.output_dir must not be empty".to_string());
    }
    if download.file_prefix.contains('/') {
        errors.push(format!(
            "download.file_prefix '{}' must not contain '/'",
            download.file_prefix
        ));
    }
}

fn is_http_url(value: &str) -> bool {
    reqwest::Url::parse(value)
        .map(|url| matches!(url.scheme(), "http" | "https") && url.host_str().is_some())
        .unwrap_or(false)
}
