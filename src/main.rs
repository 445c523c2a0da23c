use std::sync::Arc;

use aetheria_backend::config::AppConfig;
use aetheria_backend::database::StoryDatabase;
use aetheria_backend::engine::{provider_fallback, StoryEngine};
use aetheria_backend::llm_client::LlmClient;
use aetheria_backend::server::serve_backend;
use anyhow::{Context, Result};
use flume::unbounded;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,aetheria_backend=debug")),
        )
        .init();

    let config = AppConfig::load();
    let db = Arc::new(
        StoryDatabase::new(&config.database_path).context("failed to open story database")?,
    );
    let generator = Arc::new(LlmClient::new(&config));
    let (event_tx, event_rx) = unbounded();
    let engine = Arc::new(StoryEngine::new(
        db.clone(),
        generator,
        provider_fallback(&config),
        event_tx,
    ));

    tracing::info!(
        "Starting Aetheria backend (set AETHERIA_TOKEN; auth mode via AETHERIA_AUTH_MODE)"
    );

    let server_rt = tokio::runtime::Runtime::new().context("failed to start server runtime")?;
    server_rt.block_on(serve_backend(config, db, engine, event_rx))
}
