//! Server bootstrap: open both stores, build the coordinator, serve HTTP

use crate::common::{Config, Result};
use crate::content::ContentStore;
use crate::coordinator::engine::Coordinator;
use crate::coordinator::http::{create_router, AppState};
use crate::coordinator::metadata::RocksMetadataStore;
use std::sync::Arc;

pub struct Server {
    config: Config,
}

impl Server {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Open the metadata and content stores named by `config`
    pub fn open_coordinator(config: &Config) -> Result<Coordinator> {
        let metadata = Arc::new(RocksMetadataStore::open(&config.db_path)?);
        let content = Arc::new(ContentStore::open(&config.storage_root)?);
        Ok(Coordinator::new(metadata, content))
    }

    pub async fn serve(self) -> Result<()> {
        tracing::info!("Starting minirepo server {}", crate::BUILD_INFO);
        tracing::info!("  HTTP API: {}", self.config.bind_addr);
        tracing::info!("  Storage root: {}", self.config.storage_root.display());
        tracing::info!("  DB path: {}", self.config.db_path.display());

        let coordinator = Arc::new(Self::open_coordinator(&self.config)?);
        let max_upload = usize::try_from(self.config.max_upload_bytes).unwrap_or(usize::MAX);
        let router = create_router(AppState { coordinator }, max_upload);

        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;
        tracing::info!("✓ Server ready");

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        tracing::info!("Server stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
