mod app;
mod config;

use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = config::Settings::load()?;
    tracing::info!(
        bind = %settings.server.bind,
        name = %settings.server.name,
        tokens = settings.tokens.len(),
        "starting chunkline server"
    );
    app::run(settings).await
}
