//! Migration coordinator
//!
//! The coordinator is responsible for:
//! - Persisting one coordinator document per in-flight migration
//! - Driving the copy / commit / decide / cleanup protocol
//! - Recovering every migration after failover
//! - Reporting progress (currentOp)

pub mod backend;
pub mod checkpoint;
pub mod cleanup;
pub mod document;
pub mod engine;
pub mod http;
pub mod instance;
pub mod recovery;
pub mod rpc;
pub mod service;
pub mod status;
pub mod store;

pub use backend::{DocumentBackend, MemBackend, RocksBackend};
pub use checkpoint::{Checkpoint, FailPointMode, FailPoints, MigrationObserver, NoopObserver};
pub use document::{Decision, MigrationCoordinatorDocument, MigrationRequest};
pub use engine::{DecisionEngine, EngineSettings, MigrationOutcome, MigrationPhase};
pub use recovery::{RecoveryManager, RecoveryReport};
pub use service::MigrationCoordinator;
pub use status::{DurableState, MigrationStatus, StatusReporter};
pub use store::CoordinatorStore;
