use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::config::service::DownloadConfig;
use crate::error::BulkResult;
use crate::sources::download::ResourceBatch;
use crate::sources::export::ExportJob;

pub const JOB_FILE_NAME: &str = "export_job.json";

#[cfg(unix)]
const FILE_MODE: u32 = 0o600;

/// One file produced by [`NdjsonFileSink::write_batches`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WrittenFile {
    pub resource_type: String,
    pub path: PathBuf,
    pub records: usize,
}

/// Writes downloaded batches as `{dir}/{prefix}{ResourceType}.ndjson`.
#[derive(Debug, Clone)]
pub struct NdjsonFileSink {
    dir: PathBuf,
    prefix: String,
}

impl NdjsonFileSink {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
        }
    }

    pub fn from_config(config: &DownloadConfig) -> Self {
        Self::new(&config.output_dir, config.file_prefix.clone())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, resource_type: &str) -> PathBuf {
        self.dir.join(format!("{}{}.ndjson", self.prefix, resource_type))
    }

    pub fn job_path(&self) -> PathBuf {
        self.dir.join(JOB_FILE_NAME)
    }

    /// Batches of the same type land in one file, in the order given.
    pub async fn write_batches(&self, batches: &[ResourceBatch]) -> BulkResult<Vec<WrittenFile>> {
        let mut grouped: BTreeMap<&str, Vec<&ResourceBatch>> = BTreeMap::new();
        for batch in batches {
            grouped.entry(batch.resource_type.as_str()).or_default().push(batch);
        }

        let mut written = Vec::with_capacity(grouped.len());
        for (resource_type, group) in grouped {
            let mut body = String::new();
            let mut records = 0;
            for record in group.iter().flat_map(|batch| batch.content.iter()) {
                body.push_str(&record.to_string());
                body.push('\n');
                records += 1;
            }
            let path = self.path_for(resource_type);
            write_atomic(&path, body.as_bytes()).await?;
            info!(resource_type, records, "wrote {}", path.display());
            written.push(WrittenFile {
                resource_type: resource_type.to_owned(),
                path,
                records,
            });
        }
        Ok(written)
    }

    /// Persist the poll URL so an interrupted run can be resumed.
    pub async fn write_job(&self, job: &ExportJob) -> BulkResult<PathBuf> {
        let path = self.job_path();
        let body = serde_json::to_vec_pretty(job).map_err(io::Error::from)?;
        write_atomic(&path, &body).await?;
        debug!("recorded export job at {}", path.display());
        Ok(path)
    }

    pub async fn read_job(&self) -> BulkResult<Option<ExportJob>> {
        let path = self.job_path();
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(io::Error::from)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// tmp file, 0600, fsync, then rename over the target.
async fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await?;
    }
    let mut tmp_name = path.file_name().map(|name| name.to_os_string()).unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    let mut file = fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp, std::fs::Permissions::from_mode(FILE_MODE)).await?;
    }
    fs::rename(&tmp, path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn batch(resource_type: &str, ids: &[&str]) -> ResourceBatch {
        ResourceBatch {
            content: ids
                .iter()
                .map(|id| json!({"resourceType": resource_type, "id": id}))
                .collect(),
            resource_type: resource_type.to_owned(),
            url: format!("https://x/{}.ndjson", resource_type),
        }
    }

    #[tokio::test]
    async fn batches_are_grouped_by_type_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let sink = NdjsonFileSink::new(dir.path(), "run1_");

        let written = sink
            .write_batches(&[
                batch("Patient", &["p1", "p2"]),
                batch("Observation", &["o1"]),
                batch("Patient", &["p3"]),
            ])
            .await
            .unwrap();

        assert_eq!(written.len(), 2);
        let patients = std::fs::read_to_string(dir.path().join("run1_Patient.ndjson")).unwrap();
        let ids: Vec<String> = patients
            .lines()
            .map(|line| serde_json::from_str::<serde_json::Value>(line).unwrap()["id"].as_str().unwrap().to_owned())
            .collect();
        assert_eq!(ids, vec!["p1", "p2", "p3"]);
        assert!(!dir.path().join("run1_Patient.ndjson.tmp").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn files_are_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let sink = NdjsonFileSink::new(dir.path().join("nested"), "");
        sink.write_batches(&[batch("Patient", &["p1"])]).await.unwrap();

        let mode = std::fs::metadata(sink.path_for("Patient")).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[tokio::test]
    async fn job_round_trips_and_missing_job_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let sink = NdjsonFileSink::new(dir.path(), "");
        assert_eq!(sink.read_job().await.unwrap(), None);

        let job = ExportJob::new("https://x/poll/42", 30);
        let path = sink.write_job(&job).await.unwrap();
        assert_eq!(path, dir.path().join(JOB_FILE_NAME));
        assert_eq!(sink.read_job().await.unwrap(), Some(job));
    }
}
