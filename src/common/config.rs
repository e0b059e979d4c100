//! Configuration for chunkshift components
//!
//! Sources, lowest priority first: built-in defaults, an optional TOML file,
//! `CHUNKSHIFT__*` environment variables. Binaries apply CLI overrides last.

use crate::common::{Result, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,

    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    #[serde(default)]
    pub authority: AuthorityConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            coordinator: CoordinatorConfig::default(),
            authority: AuthorityConfig::default(),
            log_level: default_log_level(),
        }
    }
}

/// Shard node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Shard name (e.g. `shard0`)
    pub shard_id: String,

    /// Bind address for the HTTP API
    pub bind_addr: SocketAddr,

    /// Directory of the coordinator document store
    pub db_path: PathBuf,

    /// Base URL of the metadata authority
    pub authority_url: String,

    /// Other shards: name -> base URL
    pub peers: HashMap<String, String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            shard_id: "shard0".to_string(),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 7000)),
            db_path: PathBuf::from("./coordinator-data"),
            authority_url: "http://localhost:7100".to_string(),
            peers: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Rocksdb,
    Sled,
}

/// Migration coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Backoff for transient RPC failures
    pub retry: RetryPolicy,

    /// Delete the coordinator document as soon as cleanup is confirmed
    pub auto_forget: bool,

    /// How long completed migrations stay visible in currentOp
    #[serde(
        deserialize_with = "crate::common::utils::deserialize_duration",
        serialize_with = "serialize_secs"
    )]
    pub status_retention: Duration,

    /// Run recovery when the process starts as primary
    pub recover_on_startup: bool,

    /// Per-request timeout toward the authority and the other shards
    #[serde(
        deserialize_with = "crate::common::utils::deserialize_duration",
        serialize_with = "serialize_secs"
    )]
    pub rpc_timeout: Duration,

    pub backend: StoreBackend,
}

fn serialize_secs<S>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    s.serialize_str(&format!("{}s", d.as_secs()))
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            auto_forget: true,
            status_retention: Duration::from_secs(15 * 60),
            recover_on_startup: true,
            rpc_timeout: Duration::from_secs(10),
            backend: StoreBackend::Rocksdb,
        }
    }
}

/// Metadata authority configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorityConfig {
    pub bind_addr: SocketAddr,

    /// Directory of the chunk routing table
    pub db_path: PathBuf,

    pub backend: StoreBackend,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 7100)),
            db_path: PathBuf::from("./authority-data"),
            backend: StoreBackend::Rocksdb,
        }
    }
}

impl Config {
    /// Load configuration from an optional file plus the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        } else {
            builder = builder.add_source(config::File::with_name("chunkshift").required(false));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix("CHUNKSHIFT")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;
        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node.shard_id.is_empty() {
            return Err(crate::Error::InvalidConfig("node.shard_id is empty".into()));
        }
        if self.coordinator.retry.multiplier < 1.0 {
            return Err(crate::Error::InvalidConfig(
                "coordinator.retry.multiplier must be >= 1.0".into(),
            ));
        }
        if self.node.peers.contains_key(&self.node.shard_id) {
            return Err(crate::Error::InvalidConfig(format!(
                "node.peers must not list this node ({})",
                self.node.shard_id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
log_level = "debug"

[node]
shard_id = "shard1"
bind_addr = "127.0.0.1:7001"
authority_url = "http://cfg:7100"

[node.peers]
shard0 = "http://s0:7000"

[coordinator]
auto_forget = false
status_retention = "2m"

[coordinator.retry]
initial_backoff = "10ms"
max_backoff = "1s"
"#
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.node.shard_id, "shard1");
        assert_eq!(config.node.peers["shard0"], "http://s0:7000");
        assert!(!config.coordinator.auto_forget);
        assert_eq!(config.coordinator.status_retention, Duration::from_secs(120));
        assert_eq!(
            config.coordinator.retry.initial_backoff,
            Duration::from_millis(10)
        );
        assert_eq!(config.coordinator.retry.multiplier, 2.0);
        assert_eq!(config.coordinator.backend, StoreBackend::Rocksdb);
    }

    #[test]
    fn test_rejects_self_in_peers() {
        let mut config = Config::default();
        config
            .node
            .peers
            .insert(config.node.shard_id.clone(), "http://x".into());
        assert!(config.validate().is_err());
    }
}
