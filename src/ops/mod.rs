//! Ops commands for migration management

pub mod admin;

pub use admin::{chunk_version, count_documents, current_op, forget_migration, move_chunk};
