use anyhow::Context;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use file_vault::{config::Config, create_app, handlers::AppState, storage::LocalBlobStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "file_vault=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("Failed to load configuration")?;

    let blobs = LocalBlobStore::new(&config.storage_dir)
        .with_context(|| format!("Failed to open storage directory {}", config.storage_dir))?;
    tracing::info!(
        storage_dir = %blobs.base_path().display(),
        quota_bytes = config.default_quota_bytes,
        "Storage initialized"
    );

    let bind_address = config.bind_address();
    let state = AppState::new(config, Arc::new(blobs));
    let storage = Arc::clone(&state.storage);
    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(bind_address.as_str())
        .await
        .with_context(|| format!("Failed to bind {}", bind_address))?;
    tracing::info!("Server listening on {}", bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    for entry in storage.take_reconciliation() {
        tracing::error!(
            user_id = %entry.user_id,
            storage_key = %entry.storage_key,
            size = entry.size_bytes,
            reason = %entry.reason,
            "Shutting down with upload awaiting catalog reconciliation"
        );
    }
    tracing::info!("Server stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
