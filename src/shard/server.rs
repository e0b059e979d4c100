//! Shard server: a shard node plus its migration coordinator

use crate::common::{Config, Error, Result, SequenceGenerator};
use crate::coordinator::backend::{open_backend, CF_MIGRATION_COORDINATORS};
use crate::coordinator::checkpoint::NoopObserver;
use crate::coordinator::engine::{DecisionEngine, EngineSettings};
use crate::coordinator::http::admin_router;
use crate::coordinator::rpc::{http_client, HttpMetadataClient, HttpParticipantClient};
use crate::coordinator::service::MigrationCoordinator;
use crate::coordinator::store::CoordinatorStore;
use crate::shard::http::{shard_router, ShardState};
use crate::shard::node::ShardNode;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

pub struct ShardServer {
    config: Config,
}

/// URL other processes on this host can reach `bind` at
fn local_url(bind: SocketAddr) -> String {
    let ip = if bind.ip().is_unspecified() {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    } else {
        bind.ip()
    };
    format!("http://{}", SocketAddr::new(ip, bind.port()))
}

impl ShardServer {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Build the coordinator for this shard from configuration
    pub fn build_coordinator(&self) -> Result<Arc<MigrationCoordinator>> {
        let node = &self.config.node;
        let settings = &self.config.coordinator;

        let backend = open_backend(settings.backend, &node.db_path, CF_MIGRATION_COORDINATORS)?;
        let store = Arc::new(CoordinatorStore::new(backend));

        let mut directory = node.peers.clone();
        directory.insert(node.shard_id.clone(), local_url(node.bind_addr));
        let participants = Arc::new(HttpParticipantClient::new(directory, settings.rpc_timeout)?);
        let authority = Arc::new(HttpMetadataClient::new(
            node.authority_url.clone(),
            settings.rpc_timeout,
        )?);

        let engine = DecisionEngine::new(
            store,
            authority,
            participants,
            Arc::new(NoopObserver),
            EngineSettings {
                retry: settings.retry.clone(),
                auto_forget: settings.auto_forget,
                status_retention: settings.status_retention,
            },
        );
        Ok(Arc::new(MigrationCoordinator::new(Arc::new(engine))))
    }

    pub async fn serve(self) -> Result<()> {
        let node_config = &self.config.node;
        tracing::info!("Starting shard: {}", node_config.shard_id);
        tracing::info!("  HTTP API: {}", node_config.bind_addr);
        tracing::info!("  DB path: {}", node_config.db_path.display());
        tracing::info!("  Authority: {}", node_config.authority_url);
        tracing::info!("  Peers: {}", node_config.peers.len());

        let node = Arc::new(ShardNode::new(
            node_config.shard_id.clone(),
            SequenceGenerator::new(node_config.shard_id.clone()),
        ));
        let coordinator = self.build_coordinator()?;
        let shard_state = ShardState::new(
            node,
            node_config.peers.clone(),
            http_client(self.config.coordinator.rpc_timeout)?,
        );
        let router = shard_router(shard_state).merge(admin_router(coordinator.clone()));

        if self.config.coordinator.recover_on_startup {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                match coordinator.step_up().await {
                    Ok(report) if report.is_clean() => {
                        tracing::info!(resumed = report.resumed.len(), "startup recovery done")
                    }
                    Ok(report) => tracing::error!(
                        corrupt = ?report.corrupt,
                        failed = ?report.failed,
                        "startup recovery needs attention"
                    ),
                    Err(e) => tracing::error!("startup recovery failed: {}", e),
                }
            });
        }

        let listener = tokio::net::TcpListener::bind(node_config.bind_addr).await?;
        tracing::info!("✓ Shard {} ready", node_config.shard_id);

        tokio::select! {
            res = axum::serve(listener, router) => {
                if let Err(e) = res {
                    tracing::error!("HTTP server error: {}", e);
                    return Err(Error::Io(e));
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown requested, stepping down");
                coordinator.step_down();
            }
        }
        Ok(())
    }
}
