//! Wires storage, the upload service and the WebSocket listener together.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use chunkline_upload_server::{
    FsBlobStorage, FsChunkStaging, JsonLinesSink, StaticTokenProvider, UploadService,
    spawn_sweeper,
};
use chunkline_ws_server::{UploadHandler, UploadServer};

use crate::config::Settings;

/// Runs the server until Ctrl-C or a listener failure.
pub async fn run(settings: Settings) -> anyhow::Result<()> {
    let data_dir = &settings.store.data_dir;
    let staging_dir = data_dir.join("staging");
    let artifact_dir = data_dir.join("artifacts");
    tokio::fs::create_dir_all(&staging_dir).await?;
    tokio::fs::create_dir_all(&artifact_dir).await?;

    let service = UploadService::new(
        settings.store_config(),
        Arc::new(FsChunkStaging::new(staging_dir)),
        Arc::new(FsBlobStorage::new(artifact_dir)),
        Arc::new(JsonLinesSink::new(data_dir.join("artifacts.jsonl"))),
    );

    let recovered = service.recover().await?;
    info!(recovered, data_dir = %data_dir.display(), "session store ready");

    if settings.tokens.is_empty() {
        warn!("no access tokens configured, every client will be refused");
    }
    let tokens = settings
        .tokens
        .iter()
        .fold(StaticTokenProvider::new(), |provider, entry| {
            provider.with_token(entry.token.clone(), entry.identity.clone())
        });

    let cancel = CancellationToken::new();
    let sweeper = spawn_sweeper(
        Arc::clone(service.store()),
        settings.sweeper_config(),
        cancel.clone(),
    );

    let handler = UploadHandler::new(service, Arc::new(tokens), settings.server.name.clone());
    let server = UploadServer::new(settings.listen_config(), handler);

    let runner = Arc::clone(&server);
    let mut listener = tokio::spawn(async move { runner.run().await });

    let result = tokio::select! {
        joined = &mut listener => joined,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            server.shutdown();
            listener.await
        }
    };

    cancel.cancel();
    let _ = sweeper.await;
    result??;
    info!("server stopped");
    Ok(())
}
