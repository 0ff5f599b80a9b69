//! Decree-ordered write path of a duplicated key-value store.
//!
//! The replication layer hands each committed log entry to [`ServerWrite`],
//! which drives a per-replica [`WriteService`]. The service turns requests
//! into atomic batches on a [`StorageEngine`], stamps every record with a
//! timetag so duplicated clusters converge, and reports capacity usage to a
//! [`CapacitySink`].

pub mod batch;
pub mod capacity;
pub mod check;
pub mod config;
pub mod conflict;
pub mod context;
pub mod engine;
pub mod error;
pub mod server_write;
pub mod write_service;

pub use batch::{BatchOutcome, BatchSlot};
pub use capacity::{
    CapacityConfig, CapacitySink, CapacitySnapshot, CapacityUnitCalculator, CapacityUnitCounters,
    CapacityUsage,
};
pub use config::{ClusterIdentity, ClusterRegistry, PersistModeArg, StoreArgs, WriteServiceConfig};
pub use conflict::{ConflictResolver, Resolution};
pub use context::WriteContext;
pub use engine::{FjallEngine, MemEngine, StorageEngine, WriteBatch};
pub use error::{StorageError, WriteError, WriteResult};
pub use server_write::{DecreedMutation, ServerWrite};
pub use write_service::WriteService;
