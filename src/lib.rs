//! Two-node primary/backup replication of an append-only entry log, the
//! durability core of a metadata server. The leader appends locally and
//! streams entries to a single follower; callers pick a synchronous wait
//! (bounded by a timeout) or an asynchronous completion callback. When
//! the follower lags or is unreachable the leader degrades to a
//! leader-only mode instead of failing writes, and crash recovery
//! replays the un-applied log suffix into the embedding state machine.
//!
//! Roles are assigned from the outside: the core is told whether it is
//! the leader at startup and may later be told to take over via
//! [`ReplicatedLog::switch_to_leader`]; it never elects itself.

#[macro_use]
extern crate lazy_static;

#[macro_use]
pub mod log;

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod log_file;
pub mod replication;
pub mod task_pool;
pub mod transport;

mod replicator;

pub use crate::config::{NodeConfig, Role};
pub use crate::error::{Error, Result};
pub use crate::replication::{ApplyFn, LogCallback, ReplicatedLog, SyncStatus};
pub use crate::transport::{
    serve_append_log, AppendLogRequest, AppendLogResponse, ReplicaClient, TcpReplicaClient,
};
