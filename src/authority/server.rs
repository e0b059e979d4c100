//! Metadata authority server

use crate::authority::chunks::{ChunkRegistry, CF_CHUNKS};
use crate::authority::http::authority_router;
use crate::common::{AuthorityConfig, Error, Result};
use crate::coordinator::backend::open_backend;
use std::sync::Arc;

pub struct AuthorityServer {
    config: AuthorityConfig,
}

impl AuthorityServer {
    pub fn new(config: AuthorityConfig) -> Self {
        Self { config }
    }

    pub async fn serve(self) -> Result<()> {
        tracing::info!("Starting metadata authority");
        tracing::info!("  HTTP API: {}", self.config.bind_addr);
        tracing::info!("  DB path: {}", self.config.db_path.display());

        let backend = open_backend(self.config.backend, &self.config.db_path, CF_CHUNKS)?;
        let registry = Arc::new(ChunkRegistry::open(backend)?);
        let router = authority_router(registry);

        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;
        tracing::info!("✓ Metadata authority ready");

        tokio::select! {
            res = axum::serve(listener, router) => {
                if let Err(e) = res {
                    tracing::error!("HTTP server error: {}", e);
                    return Err(Error::Io(e));
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown requested");
            }
        }
        Ok(())
    }
}
