//! Uploads one file to a chunkline server, resuming an earlier session
//! when asked. Ctrl-C pauses the upload and prints how to resume it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use chunkline_transfer::DEFAULT_CHUNK_SIZE;
use chunkline_upload_client::{
    ChunkSizePolicy, FileSource, Orchestrator, OrchestratorConfig, RetryPolicy, TaskOutcome,
    TaskRegistry, UploadEvent, UploadOptions, WsTransport,
};

#[derive(Parser)]
#[command(author, version, about = "Upload a file to a chunkline server", long_about = None)]
struct Cli {
    /// File to upload
    file: PathBuf,

    /// Server WebSocket URL
    #[arg(long, default_value = "ws://127.0.0.1:7460")]
    url: String,

    /// Access token configured on the server
    #[arg(long)]
    token: String,

    /// Continue the given upload session instead of starting a new one
    #[arg(long = "resume", value_name = "UPLOAD_ID")]
    resume: Option<String>,

    /// Chunk size in bytes; must match the original when resuming
    #[arg(long)]
    chunk_size: Option<u64>,

    /// Chunks in flight at once
    #[arg(long, default_value_t = 4)]
    concurrency: usize,

    /// Per-attempt timeout in seconds
    #[arg(long, default_value_t = 120)]
    timeout: u64,

    /// Attempts per chunk before the upload fails
    #[arg(long, default_value_t = 5)]
    max_attempts: u32,

    /// Name stored on the server (defaults to the file name)
    #[arg(long)]
    name: Option<String>,

    #[arg(long, default_value = "application/octet-stream")]
    mime_type: String,

    /// Opaque context forwarded with the artifact
    #[arg(long)]
    workspace: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let transport = Arc::new(WsTransport::new(&cli.url, &cli.token, "chunkline-push"));
    let welcome = transport.connect().await?;
    info!(
        server = %welcome.server_name,
        identity = %welcome.identity,
        max_chunk_size = welcome.max_chunk_size,
        "connected"
    );

    let chunk_size = cli
        .chunk_size
        .unwrap_or_else(|| DEFAULT_CHUNK_SIZE.min(welcome.max_chunk_size));
    let config = OrchestratorConfig {
        max_concurrent_chunks: cli.concurrency.max(1),
        attempt_timeout: Duration::from_secs(cli.timeout.max(1)),
        chunk_size: ChunkSizePolicy::Fixed(chunk_size),
        retry: RetryPolicy {
            max_attempts: cli.max_attempts.max(1),
            ..Default::default()
        },
        ..Default::default()
    };
    let orch = Orchestrator::new(transport.clone(), TaskRegistry::new(), config);

    let source = Arc::new(FileSource::open(&cli.file)?);
    let options = UploadOptions {
        file_name: cli.name.clone(),
        mime_type: Some(cli.mime_type.clone()),
        workspace_context: cli.workspace.clone(),
        chunk_size: Some(chunk_size),
    };

    let reporter = tokio::spawn(report(orch.subscribe()));

    let file_id = match &cli.resume {
        Some(upload_id) => orch.adopt(source, options, upload_id.clone())?,
        None => orch.enqueue(source, options)?,
    };

    let run = async {
        if cli.resume.is_some() {
            orch.resume(&file_id).await
        } else {
            orch.run(&file_id).await
        }
    };
    tokio::pin!(run);

    let outcome = tokio::select! {
        outcome = &mut run => outcome,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, pausing upload");
            if let Err(e) = orch.pause(&file_id) {
                warn!("could not pause: {e}");
            }
            run.await
        }
    };

    reporter.abort();
    transport.close().await;

    match outcome {
        Ok(TaskOutcome::Completed(artifact)) => {
            println!("{}", serde_json::to_string_pretty(&artifact)?);
            Ok(())
        }
        Ok(TaskOutcome::Paused) => {
            match orch.task(&file_id).and_then(|t| t.upload_id()) {
                Some(upload_id) => println!(
                    "paused; continue with: chunkline-push --resume {upload_id} --chunk-size {chunk_size} {}",
                    cli.file.display()
                ),
                None => println!("paused before the server session was created; start again"),
            }
            Ok(())
        }
        Ok(TaskOutcome::Cancelled) => {
            println!("cancelled");
            Ok(())
        }
        Err(e) => {
            if let Some(upload_id) = orch.task(&file_id).and_then(|t| t.upload_id()) {
                warn!(upload_id = %upload_id, "upload failed; it can be resumed with --resume");
            }
            Err(anyhow::anyhow!(e.actionable_reason()))
        }
    }
}

/// Logs progress in 10% steps and every retry.
async fn report(mut events: broadcast::Receiver<UploadEvent>) {
    let mut last_decile = None;
    loop {
        match events.recv().await {
            Ok(UploadEvent::Progress {
                acked_bytes,
                total_bytes,
                percentage,
                bytes_per_second,
                ..
            }) => {
                let decile = (percentage / 10.0).floor() as u32;
                if last_decile != Some(decile) {
                    last_decile = Some(decile);
                    info!(
                        acked_bytes,
                        total_bytes,
                        kib_per_second = (bytes_per_second / 1024.0).round() as u64,
                        "{percentage:.0}% uploaded"
                    );
                }
            }
            Ok(UploadEvent::ChunkRetry {
                chunk_index,
                attempt,
                delay,
                error,
                ..
            }) => {
                warn!(chunk_index, attempt, delay_ms = delay.as_millis() as u64, "retrying chunk: {error}");
            }
            Ok(UploadEvent::StatusChanged { status, .. }) => info!(%status, "status changed"),
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "progress reporter lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
