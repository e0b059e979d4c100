//! Metadata authority binary

use chunkshift::authority::AuthorityServer;
use chunkshift::common::{Config, StoreBackend};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "chunkshift-config")]
#[command(about = "chunkshift metadata authority (chunk routing table)")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the metadata authority
    Serve {
        /// Config file (TOML)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Bind address for HTTP
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Routing table directory
        #[arg(long)]
        db: Option<PathBuf>,

        /// Keep the routing table in memory only
        #[arg(long)]
        in_memory: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            bind,
            db,
            in_memory,
        } => {
            let mut config = Config::load(config.as_deref())?;
            if let Some(bind) = bind {
                config.authority.bind_addr = bind;
            }
            if let Some(db) = db {
                config.authority.db_path = db;
            }
            if in_memory {
                config.authority.backend = StoreBackend::Memory;
            }

            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| config.log_level.clone().into()),
                )
                .with(tracing_subscriber::fmt::layer())
                .init();

            AuthorityServer::new(config.authority).serve().await?;
        }
    }

    Ok(())
}
