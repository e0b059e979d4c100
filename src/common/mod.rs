//! Common utilities and types shared across chunkshift

pub mod config;
pub mod error;
pub mod range;
pub mod retry;
pub mod utils;

pub use config::{AuthorityConfig, Config, CoordinatorConfig, NodeConfig, StoreBackend};
pub use error::{Error, Result};
pub use range::ChunkRange;
pub use retry::RetryPolicy;
pub use utils::{parse_duration, timestamp_now_millis, SequenceGenerator};
