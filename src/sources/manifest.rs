use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{BulkError, BulkResult};

/// One file of an export, as listed in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFile {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
}

/// Completion payload of a bulk export. Unknown keys are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub request: String,
    #[serde(default)]
    pub output: Vec<OutputFile>,
    #[serde(default)]
    pub transaction_time: Option<String>,
    /// OperationOutcome files describing per-resource failures
    #[serde(default)]
    pub error: Option<Vec<OutputFile>>,
    #[serde(default)]
    pub requires_access_token: Option<bool>,
}

impl Manifest {
    pub fn from_json(body: &str, url: &str) -> BulkResult<Self> {
        serde_json::from_str(body).map_err(|e| BulkError::ManifestDecode {
            url: url.to_owned(),
            reason: e.to_string(),
        })
    }

    /// Distinct resource types, sorted.
    pub fn resource_types(&self) -> Vec<String> {
        self.output
            .iter()
            .map(|file| file.resource_type.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn files_of_type<'a>(&'a self, resource_type: &'a str) -> impl Iterator<Item = &'a OutputFile> + 'a {
        self.output
            .iter()
            .filter(move |file| file.resource_type == resource_type)
    }

    pub fn error_files(&self) -> &[OutputFile] {
        self.error.as_deref().unwrap_or_default()
    }

    /// Absent flag means the files sit behind the same authorization.
    pub fn needs_access_token(&self) -> bool {
        self.requires_access_token.unwrap_or(true)
    }
}
