//! # chunkshift
//!
//! Crash-recoverable chunk migration between shards:
//! - One durable coordinator document per in-flight migration
//! - Write-once commit/abort decision, made durable before it is acted on
//! - Step-up recovery that converges to the same decision after any failover
//! - Idempotent participant RPCs with retry on transient failures
//!
//! ## Architecture
//!
//! ```text
//!            ┌──────────────────────────────┐
//!            │      Metadata authority      │
//!            │  (chunk owner + version)     │
//!            └──────────────▲───────────────┘
//!                           │ commitChunk / abortChunk
//! ┌─────────────────────────┴──────────┐
//! │ Donor shard + migration coordinator │
//! │   coordinator document store        │
//! └──────┬───────────────────────▲──────┘
//!        │ cloneRange / decision │ deleteRange
//!   ┌────▼───────────────────────┴───┐
//!   │        Recipient shard          │
//!   └─────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Start the metadata authority
//! ```bash
//! chunkshift-config serve --bind 0.0.0.0:7100 --db ./authority-data
//! ```
//!
//! ### Start two shards
//! ```bash
//! chunkshift-shard serve --id shard0 --bind 0.0.0.0:7000 \
//!   --peers shard1=http://localhost:7001
//! chunkshift-shard serve --id shard1 --bind 0.0.0.0:7001 \
//!   --peers shard0=http://localhost:7000
//! ```
//!
//! ### Use the CLI
//! ```bash
//! chunkshift move-chunk --ns db.users --min 0 --max 1000 --from shard0 --to shard1
//! chunkshift current-op
//! chunkshift forget <migration-id>
//! chunkshift count --shard http://localhost:7001 --ns db.users
//! ```

#![allow(clippy::result_large_err)]

pub mod authority;
pub mod common;
pub mod coordinator;
pub mod ops;
pub mod shard;

// Re-export commonly used types
pub use common::{ChunkRange, Config, Error, Result};
pub use coordinator::{MigrationCoordinator, MigrationRequest};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
