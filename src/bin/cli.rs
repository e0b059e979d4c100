//! CLI for migration operations

use chunkshift::common::ChunkRange;
use chunkshift::coordinator::MigrationRequest;
use chunkshift::ops::{chunk_version, count_documents, current_op, forget_migration, move_chunk};
use clap::{Parser, Subcommand};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "chunkshift")]
#[command(about = "chunkshift chunk migration CLI")]
#[command(version)]
struct Cli {
    /// Coordinator (donor shard) URL
    #[arg(long, default_value = "http://localhost:7000")]
    coordinator: String,

    /// Metadata authority URL
    #[arg(long, default_value = "http://localhost:7100")]
    authority: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Move a chunk and wait for the decision
    MoveChunk {
        /// Namespace (db.collection)
        #[arg(long)]
        ns: String,

        /// Range minimum (inclusive)
        #[arg(long, allow_hyphen_values = true)]
        min: i64,

        /// Range maximum (exclusive)
        #[arg(long, allow_hyphen_values = true)]
        max: i64,

        /// Donor shard
        #[arg(long)]
        from: String,

        /// Recipient shard
        #[arg(long)]
        to: String,

        /// Expected chunk version (looked up on the authority if omitted)
        #[arg(long)]
        version: Option<u64>,
    },

    /// Forget a decided migration
    Forget {
        /// Migration id
        id: Uuid,
    },

    /// Show in-progress and recently completed migrations
    CurrentOp {
        /// Print raw JSON
        #[arg(long)]
        json: bool,
    },

    /// Count documents on a shard
    Count {
        /// Shard URL
        #[arg(long)]
        shard: String,

        /// Namespace (db.collection)
        #[arg(long)]
        ns: String,

        #[arg(long, allow_hyphen_values = true)]
        min: Option<i64>,

        #[arg(long, allow_hyphen_values = true)]
        max: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::MoveChunk {
            ns,
            min,
            max,
            from,
            to,
            version,
        } => {
            let range = ChunkRange::new(min, max)?;
            let expected_version = match version {
                Some(v) => v,
                None => chunk_version(&cli.authority, &ns, range).await?,
            };
            let request = MigrationRequest {
                namespace: ns,
                range,
                donor_shard: from,
                recipient_shard: to,
                expected_version,
            };
            let outcome = move_chunk(&cli.coordinator, &request).await?;
            println!("Migration {}:", outcome.migration_id);
            println!("  Decision: {}", outcome.decision);
            if let Some(reason) = outcome.abort_reason {
                println!("  Abort reason: {}", reason);
            }
        }

        Commands::Forget { id } => {
            forget_migration(&cli.coordinator, id).await?;
            println!("Migration {} forgotten", id);
        }

        Commands::CurrentOp { json } => {
            let ops = current_op(&cli.coordinator).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&ops)?);
            } else if ops.is_empty() {
                println!("No migrations");
            } else {
                for op in ops {
                    println!("{} {}", op.migration_id, op.namespace);
                    println!("  Range: [{}, {})", op.range_min, op.range_max);
                    println!("  {} -> {}", op.donor_shard, op.recipient_shard);
                    println!("  State: {}", op.last_durable_state.label());
                    println!("  Completed: {}", op.migration_completed);
                    if let Some(reason) = op.abort_reason {
                        println!("  Abort reason: {}", reason);
                    }
                }
            }
        }

        Commands::Count {
            shard,
            ns,
            min,
            max,
        } => {
            let range = match (min, max) {
                (None, None) => None,
                (min, max) => Some(ChunkRange::new(
                    min.unwrap_or(i64::MIN),
                    max.unwrap_or(i64::MAX),
                )?),
            };
            let count = count_documents(&shard, &ns, range).await?;
            println!("{}", count);
        }
    }

    Ok(())
}
