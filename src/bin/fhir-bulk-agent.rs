use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use fhir_bulk_agent::config::proc_loader;
use fhir_bulk_agent::observability::metrics::get_metrics;
use fhir_bulk_agent::server::server;
use fhir_bulk_agent::session::{BulkSession, ResumeFrom, RunOptions};
use fhir_bulk_agent::utils::logging::{self, LogLevel};
use tokio::select;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, env = "CONFIG", default_value = "fhir-bulk-agent.yaml")]
    config: PathBuf,
    #[arg(long, env = "LOG_LEVEL", value_enum)]
    log_level: Option<LogLevel>,
    /// Poll an existing export instead of starting one. Without a URL the
    /// job recorded in the output directory is resumed.
    #[arg(long, value_name = "POLL_URL", num_args = 0..=1)]
    resume: Option<Option<String>>,
    /// Overrides export.group_id
    #[arg(long, env = "GROUP_ID")]
    group_id: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // -------------------------------
    // 1. Load YAML config + logging
    // -------------------------------

    let args = Args::parse();
    let service_config = proc_loader::file_to_config(&args.config).await?;
    logging::run(&service_config, args.log_level);

    // -------------------------------
    // 2. Build the session
    // -------------------------------

    let session = BulkSession::from_config(&service_config)?;
    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    // -------------------------------
    // 3. Optional status/metrics server
    // -------------------------------

    let server_handle = service_config.settings.server.clone().map(|server_config| {
        let metrics_config = service_config.settings.metrics.clone();
        let export_state = session.state_handle();
        let stop = shutdown.clone();
        tokio::spawn(async move {
            if let Err(err) = server::start(&server_config, &metrics_config, export_state, stop).await {
                error!("{:#}", err);
            }
        })
    });

    // -------------------------------
    // 4. Run the export
    // -------------------------------

    let options = RunOptions {
        group_id: args.group_id,
        resume: args
            .resume
            .map(|url| url.map_or(ResumeFrom::JobFile, ResumeFrom::Url)),
    };
    let result = session.run(&options, &shutdown).await;

    shutdown.cancel();
    if let Some(handle) = server_handle {
        let _ = handle.await;
    }
    info!("final metrics:\n{}", get_metrics().await.render());

    match result {
        Ok(summary) => {
            info!(
                files = summary.files.len(),
                records = summary.records,
                error_records = summary.error_records,
                "bulk export finished: {}",
                summary.job.content_location
            );
            Ok(())
        }
        Err(err) => {
            error!("bulk export failed: {:#}", err);
            Err(err)
        }
    }
}

async fn watch_signals(shutdown: CancellationToken) -> Result<()> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    select! {
        _ = sigint.recv() => info!("Received SIGINT (Ctrl+C), cancelling ..."),
        _ = sigterm.recv() => info!("Received SIGTERM, cancelling ..."),
        _ = shutdown.cancelled() => return Ok(()),
    }
    shutdown.cancel();
    Ok(())
}
