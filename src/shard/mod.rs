//! Shard node: the participant side of a migration
//!
//! A shard holds collections of JSON documents, answers the coordinator's
//! participant RPCs (clone, decision delivery, range deletion) and keeps an
//! oplog of its primary writes.

pub mod collection;
pub mod http;
pub mod local;
pub mod node;
pub mod oplog;
pub mod server;

pub use collection::{Collection, IndexSpec, WriteMode};
pub use http::{shard_router, ShardState};
pub use local::LocalParticipants;
pub use node::ShardNode;
pub use oplog::{apply_oplog, ApplyReport, OplogEntry, OplogOp};
pub use server::ShardServer;
