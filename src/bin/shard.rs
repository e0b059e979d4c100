//! Shard binary: shard node plus migration coordinator

use anyhow::Context;
use chunkshift::common::{Config, StoreBackend};
use chunkshift::shard::ShardServer;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "chunkshift-shard")]
#[command(about = "chunkshift shard node with migration coordinator")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start shard server
    Serve {
        /// Config file (TOML)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Shard name
        #[arg(long)]
        id: Option<String>,

        /// Bind address for HTTP
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Coordinator document store directory
        #[arg(long)]
        db: Option<PathBuf>,

        /// Metadata authority URL
        #[arg(long)]
        authority: Option<String>,

        /// Other shards as name=url (comma-separated)
        #[arg(long, value_delimiter = ',')]
        peers: Vec<String>,

        /// Keep coordinator documents in memory only
        #[arg(long)]
        in_memory: bool,
    },
}

fn parse_peer(spec: &str) -> anyhow::Result<(String, String)> {
    let (name, url) = spec
        .split_once('=')
        .with_context(|| format!("peer '{}' is not name=url", spec))?;
    Ok((name.trim().to_string(), url.trim().to_string()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            id,
            bind,
            db,
            authority,
            peers,
            in_memory,
        } => {
            let mut config = Config::load(config.as_deref())?;
            if let Some(id) = id {
                config.node.shard_id = id;
            }
            if let Some(bind) = bind {
                config.node.bind_addr = bind;
            }
            if let Some(db) = db {
                config.node.db_path = db;
            }
            if let Some(authority) = authority {
                config.node.authority_url = authority;
            }
            for spec in &peers {
                let (name, url) = parse_peer(spec)?;
                config.node.peers.insert(name, url);
            }
            if in_memory {
                config.coordinator.backend = StoreBackend::Memory;
            }
            config.validate()?;

            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| config.log_level.clone().into()),
                )
                .with(tracing_subscriber::fmt::layer())
                .init();

            ShardServer::new(config).serve().await?;
        }
    }

    Ok(())
}
