//! The transactional commit engine of the quiver graph database.
//!
//! The engine takes the relation additions and deletions accumulated by a
//! transaction, translates them into physical key/column/value mutations,
//! acquires the optimistic locks the configured consistency model requires,
//! flushes the primary store and any secondary index backends in a fixed
//! order, and writes a transaction-log record sufficient to reconcile
//! partial failures after a crash.
//!
//! The query engine, schema management, and the storage backends themselves
//! are external collaborators; the engine consumes them through the traits
//! in [`db::backend`].

pub mod config;
pub mod db;
pub mod error;

pub use config::{GraphConfig, SystemClock, TimestampProvider, TxConfig};
pub use db::graph::{GraphDb, GraphTx};
pub use error::{CommitError, GraphError, IndexError, InvariantViolation, StorageError};
