//! Write-ahead transaction-log records for the quiver commit engine.
//!
//! A committed transaction leaves up to three entries in the transaction log,
//! each keyed by `(tx id, phase)`:
//!
//! - a *record* carrying a [`TxLogHeader`] followed by the opaque mutation
//!   payload produced by the backend transaction,
//! - for schema sub-transactions on non-isolated backends, a second record
//!   with the `PREFLUSH_SYSTEM`/`SUCCESS_SYSTEM`/`FAILURE_SYSTEM` statuses,
//! - a *trailer* ([`TxLogTrailer`]) repeating the header layout with the
//!   final status, plus failure details when the status is `FAILURE`.
//!
//! The byte layout is fixed: recovery tooling reads these entries without
//! access to the schema, so every field is encoded with the primitives from
//! [`quiver_codec`] and covered by round-trip tests.
//!
//! The optional trigger log (an audit stream of committed mutations) uses the
//! [`TriggerRecord`] framing from the [`trigger`] module.

mod record;
pub mod recovery;
mod store;
pub mod trigger;

pub use record::{ConfigBlock, FailureInfo, LogStatus, TxLogHeader, TxLogTrailer};
pub use store::{LogError, LogStore, MemoryLog};
pub use trigger::{TriggerEntry, TriggerRecord};
