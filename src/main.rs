use anyhow::Result;
use chat_drive::{
    config::{self, BlobBackend},
    db,
    handlers::AppState,
    routes,
    services::blob_client::{MemoryBlobStore, RemoteBlobStore, TelegramBlobStore},
};
use std::{io::ErrorKind, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    // --- Logging setup ---
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!(
        addr = %cfg.addr(),
        backend = ?cfg.blob_backend,
        database_url = %cfg.database_url,
        proxy_base = %cfg.proxy_base,
        max_upload_bytes = cfg.max_upload_bytes,
        "Starting chat-drive"
    );

    // --- Initialize SQLite connection ---
    let db = Arc::new(db::connect(&cfg.database_url).await?);

    // --- Handle migration mode ---
    db::run_migrations(&db).await?;
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Remote blob store ---
    let blobs: Arc<dyn RemoteBlobStore> = match cfg.blob_backend {
        BlobBackend::Telegram => Arc::new(TelegramBlobStore::new(cfg.blob_store.clone())?),
        BlobBackend::Memory => {
            tracing::warn!("Using in-memory blob store; uploaded content is lost on exit");
            Arc::new(MemoryBlobStore::new())
        }
    };

    // --- Build router ---
    let state = AppState::new(db, blobs, cfg.gateway_settings());
    let app = routes::routes::app(state);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", err);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
