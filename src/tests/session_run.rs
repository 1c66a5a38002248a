// End-to-end run against a local vendor:
// discovery -> token -> $export (202) -> poll (202, 200) -> downloads -> ndjson files.
// Also resume from the recorded job file with a configured smart configuration.

#[cfg(test)]
mod test {
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use axum::extract::Path;
    use axum::response::{IntoResponse, Response};
    use axum::routing::{get, post};
    use axum::Json;
    use http::StatusCode;
    use tokio_util::sync::CancellationToken;

    use crate::config::proc_loader::parse_config;
    use crate::session::{BulkSession, ResumeFrom, RunOptions};
    use crate::sinks::ndjson_file::JOB_FILE_NAME;
    use crate::sources::export::{ExportJob, ExportState};
    use crate::tests::common::*;

    #[derive(Default)]
    struct Counters {
        discovery: AtomicUsize,
        token: AtomicUsize,
        kickoff: AtomicUsize,
        poll: AtomicUsize,
    }

    fn vendor(addr: SocketAddr, counters: Arc<Counters>) -> Router {
        let base = format!("http://{}", addr);
        let (c1, c2, c3, c4) = (counters.clone(), counters.clone(), counters.clone(), counters);
        let (b1, b2, b3) = (base.clone(), base.clone(), base);

        Router::new()
            .route(
                "/fhir/.well-known/smart-configuration",
                get(move || {
                    let (counters, base) = (c1.clone(), b1.clone());
                    async move {
                        counters.discovery.fetch_add(1, Ordering::SeqCst);
                        Json(json!({ "token_endpoint": format!("{}/token", base) }))
                    }
                }),
            )
            .route(
                "/token",
                post(move || {
                    let counters = c2.clone();
                    async move {
                        counters.token.fetch_add(1, Ordering::SeqCst);
                        Json(token_body("session-token", 300))
                    }
                }),
            )
            .route(
                "/fhir/Group/{group_id}/$export",
                get(move |Path(group_id): Path<String>| {
                    let (counters, base) = (c3.clone(), b2.clone());
                    async move {
                        counters.kickoff.fetch_add(1, Ordering::SeqCst);
                        let mut response = StatusCode::ACCEPTED.into_response();
                        let location = format!("{}/poll/{}", base, group_id);
                        response.headers_mut().insert("content-location", location.parse().unwrap());
                        response.headers_mut().insert("retry-after", "1".parse().unwrap());
                        response
                    }
                }),
            )
            .route(
                "/poll/{group_id}",
                get(move || {
                    let (counters, base) = (c4.clone(), b3.clone());
                    async move {
                        let response: Response = if counters.poll.fetch_add(1, Ordering::SeqCst) == 0 {
                            StatusCode::ACCEPTED.into_response()
                        } else {
                            Json(json!({
                                "transactionTime": "2024-03-01T10:00:00Z",
                                "request": format!("{}/fhir/Group/g1/$export", base),
                                "requiresAccessToken": true,
                                "output": [
                                    {"type": "Patient", "url": format!("{}/files/Patient.ndjson", base)},
                                    {"type": "Observation", "url": format!("{}/files/Observation.ndjson", base)}
                                ],
                                "error": [
                                    {"type": "OperationOutcome", "url": format!("{}/files/errors.ndjson", base)}
                                ]
                            }))
                            .into_response()
                        };
                        response
                    }
                }),
            )
            .route(
                "/files/{name}",
                get(|Path(name): Path<String>| async move {
                    match name.as_str() {
                        "Patient.ndjson" => "{\"resourceType\":\"Patient\",\"id\":\"p1\"}\n{\"resourceType\":\"Patient\",\"id\":\"p2\"}\n",
                        "Observation.ndjson" => "{\"resourceType\":\"Observation\",\"id\":\"o1\"}\n",
                        _ => "{\"resourceType\":\"OperationOutcome\",\"id\":\"e1\"}\n",
                    }
                }),
            )
    }

    fn config_yaml(addr: SocketAddr, key_path: &std::path::Path, output_dir: &std::path::Path, pinned: bool) -> String {
        let smart_configuration = if pinned {
            format!("  smart_configuration:\n    token_endpoint: http://{}/token\n", addr)
        } else {
            String::new()
        };
        format!(
            r#"
settings:
  retry: {{ attempts: 2, base_delay_ms: 1, max_delay_ms: 5 }}
vendor:
  base_url: http://{addr}/fhir
  scopes: [system/Group.read, system/Patient.read]
{smart_configuration}client:
  client_id: {{ value: "{client_id}" }}
  jku: {jku}
  kid: {kid}
  key: {{ path: "{key}" }}
export:
  group_id: g1
  timeout_seconds: 30
download:
  concurrency: 2
  output_dir: "{out}"
  file_prefix: "run_"
"#,
            addr = addr,
            smart_configuration = smart_configuration,
            client_id = CLIENT_ID,
            jku = TEST_JKU,
            kid = TEST_KID,
            key = key_path.display(),
            out = output_dir.display(),
        )
    }

    async fn setup(pinned: bool) -> (BulkSession, Arc<Counters>, tempfile::TempDir) {
        let counters = Arc::new(Counters::default());
        let counters_c = counters.clone();
        let (_h, addr) = spawn_axum_with(move |addr| vendor(addr, counters_c)).await;

        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("client.pem");
        std::fs::write(&key_path, &test_keys().private_pem).unwrap();
        let out = dir.path().join("out");

        let config = parse_config(&config_yaml(addr, &key_path, &out, pinned)).await.unwrap();
        let session = BulkSession::from_config(&config).unwrap();
        (session, counters, dir)
    }

    #[tokio::test]
    async fn full_export_is_written_to_disk() {
        let (session, counters, dir) = setup(false).await;

        let summary = session
            .run(&RunOptions::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.records, 3);
        assert_eq!(summary.error_records, 1);
        assert_eq!(summary.files.len(), 3);
        assert_eq!(summary.transaction_time.as_deref(), Some("2024-03-01T10:00:00Z"));
        assert!(summary.job.content_location.ends_with("/poll/g1"));
        assert_eq!(summary.job.retry_after, 1);

        let out = dir.path().join("out");
        let patients = std::fs::read_to_string(out.join("run_Patient.ndjson")).unwrap();
        assert_eq!(patients.lines().count(), 2);
        assert!(out.join("run_Observation.ndjson").exists());
        assert!(out.join("run_OperationOutcome.ndjson").exists());

        let recorded: ExportJob =
            serde_json::from_str(&std::fs::read_to_string(out.join(JOB_FILE_NAME)).unwrap()).unwrap();
        assert_eq!(recorded, summary.job);

        assert_eq!(counters.discovery.load(Ordering::SeqCst), 1);
        assert_eq!(counters.token.load(Ordering::SeqCst), 1);
        assert_eq!(counters.kickoff.load(Ordering::SeqCst), 1);
        assert_eq!(counters.poll.load(Ordering::SeqCst), 2);
        assert!(matches!(*session.state_handle().read().await, ExportState::Completed { outputs: 2, .. }));
    }

    #[tokio::test]
    async fn recorded_job_is_resumed_without_kickoff() {
        let (session, counters, _dir) = setup(true).await;

        // a first run records its job, as an interrupted run would have
        let first = session
            .run(&RunOptions { group_id: Some("g2".to_owned()), resume: None }, &CancellationToken::new())
            .await
            .unwrap();
        assert!(first.job.content_location.ends_with("/poll/g2"));
        assert_eq!(counters.kickoff.load(Ordering::SeqCst), 1);

        let resumed = session
            .run(&RunOptions { group_id: None, resume: Some(ResumeFrom::JobFile) }, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(resumed.job, first.job);
        assert_eq!(resumed.records, 3);
        assert_eq!(counters.kickoff.load(Ordering::SeqCst), 1);
        assert_eq!(counters.discovery.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn resume_without_recorded_job_fails() {
        let (session, counters, _dir) = setup(true).await;
        let err = session
            .run(&RunOptions { group_id: None, resume: Some(ResumeFrom::JobFile) }, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains(JOB_FILE_NAME), "{}", err);
        assert_eq!(counters.poll.load(Ordering::SeqCst), 0);
    }
}
