//! Metadata authority: the config-server side of chunk ownership

pub mod chunks;
pub mod http;
pub mod server;

pub use chunks::{ChunkInfo, ChunkRegistry, CF_CHUNKS, COMMIT_VERSION_ERROR_FAILPOINT};
pub use http::authority_router;
pub use server::AuthorityServer;
