//! Relay server binary
//!
//! Run with: cargo run -p docrelay --bin docrelay-server [config.toml]

use std::path::PathBuf;

use docrelay::{
    config::RelayConfig,
    server::{state::AppState, RelayServer},
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "docrelay=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let path = std::env::args().nth(1).map(PathBuf::from);
    let config = RelayConfig::load(path.as_deref())?;
    config.validate()?;

    tracing::info!("Configuration loaded");
    tracing::info!("  - Queue database: {}", config.queue.database_path.display());
    tracing::info!("  - Max attempts: {}", config.queue.max_attempts);
    tracing::info!(
        "  - Sinks: {} + {}",
        config.primary_sink.kind(),
        config.secondary_sink.kind()
    );
    tracing::info!("  - Columns: {}", config.extraction.schema.column_names().join(", "));

    let (state, worker) = AppState::new(config).await?;
    let server = RelayServer::new(state);
    tracing::info!("Health: http://{}/health", server.address());

    tokio::spawn(worker.run());

    tokio::select! {
        result = server.start() => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown requested; leased tasks will be redelivered after their lease expires");
        }
    }

    Ok(())
}
