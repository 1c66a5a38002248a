//! # FHIR Bulk Export Agent
//!
//! Client for SMART-on-FHIR backend-services bulk export: discovers a
//! vendor's OAuth endpoints, authenticates with a signed JWT assertion,
//! drives an asynchronous `$export` job to completion and downloads the
//! resulting NDJSON files.
//!
//! Modules:
//! - `config`: YAML service configuration, scope presets and validation
//! - `cache`: bearer token and its shared cache
//! - `sources`: discovery, signing, authorization, export polling and downloads
//! - `sinks`: NDJSON file output
//! - `session`: one end-to-end run built from configuration

pub mod cache;
pub mod config;
pub mod error;
pub mod helpers;
pub mod observability;
pub mod resilience;
pub mod server;
pub mod session;
pub mod sinks;
pub mod sources;
pub mod utils;

#[cfg(test)]
mod tests;

pub use crate::error::{BulkError, BulkResult};
