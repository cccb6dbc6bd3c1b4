//! Contracts of the storage backends the engine consumes, and the
//! transaction façade over them.
//!
//! A [`Backend`] bundles the primary edge store, the composite-index store
//! (both [`KeyColumnValueStore`]s, usually two stores of one physical
//! backend), any number of named [`MixedIndexBackend`]s, and the log stores.
//! Per logical transaction, [`Backend::begin_tx`] yields a
//! [`transaction::BackendTransaction`] that queues mutations and lock claims
//! until the commit engine flushes them.

pub mod memory;
pub mod transaction;

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use quiver_txlog::{LogError, LogStore};

use crate::error::{IndexError, StorageError};

use super::relation::PropertyValue;
use super::schema::IndexMutationKind;
use super::{Entry, EntryList, StaticBuffer};

/// A contiguous column range within one key, optionally row-limited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceQuery {
    /// Inclusive start column.
    pub start: StaticBuffer,
    /// Exclusive end column.
    pub end: StaticBuffer,
    pub limit: Option<usize>,
}

impl SliceQuery {
    pub fn new(start: StaticBuffer, end: StaticBuffer) -> Self {
        Self {
            start,
            end,
            limit: None,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn contains(&self, column: &[u8]) -> bool {
        column >= self.start.as_ref() && column < self.end.as_ref()
    }
}

/// A [`SliceQuery`] bound to one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySliceQuery {
    pub key: StaticBuffer,
    pub slice: SliceQuery,
}

/// Queued mutations for one key: entries to add, columns to delete.
/// Deletions are applied before additions.
#[derive(Debug, Clone, Default)]
pub struct KcvMutation {
    pub additions: Vec<Entry>,
    pub deletions: Vec<StaticBuffer>,
}

impl KcvMutation {
    pub fn is_empty(&self) -> bool {
        self.additions.is_empty() && self.deletions.is_empty()
    }

    pub fn merge(&mut self, additions: Vec<Entry>, deletions: Vec<StaticBuffer>) {
        self.additions.extend(additions);
        self.deletions.extend(deletions);
    }
}

/// A best-effort optimistic lock claim on `(key, column)`.
///
/// Claims with an `expected` value additionally assert the current value of
/// the entry (deletion locks); claims without one only reserve the column
/// against concurrent writers (addition locks).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockClaim {
    pub key: StaticBuffer,
    pub column: StaticBuffer,
    pub expected: Option<StaticBuffer>,
}

/// Scan preference for key enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOrder {
    Unordered,
    Ordered,
}

/// Capability flags of a [`KeyColumnValueStore`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreFeatures {
    pub ordered_scan: bool,
    pub unordered_scan: bool,
}

pub type KeyIterator = Box<dyn Iterator<Item = Result<StaticBuffer, StorageError>> + Send>;

/// The primary storage contract: an ordered map of keys to sorted
/// column/value entries.
pub trait KeyColumnValueStore: Send + Sync {
    fn name(&self) -> &str;

    fn features(&self) -> StoreFeatures;

    /// All entries of `query.key` whose column falls in the slice, in
    /// column order, up to the limit.
    fn slice(&self, query: &KeySliceQuery) -> Result<EntryList, StorageError>;

    /// [`Self::slice`] over several keys at once.
    fn multi_slice(
        &self,
        keys: &[StaticBuffer],
        slice: &SliceQuery,
    ) -> Result<Vec<(StaticBuffer, EntryList)>, StorageError>;

    /// Enumerate keys having at least one entry in `filter`.
    fn scan_keys(&self, filter: &SliceQuery, order: ScanOrder) -> Result<KeyIterator, StorageError>;

    /// Apply queued mutations. Per key, deletions are applied before
    /// additions; keys are applied in iteration order of the map.
    fn apply(
        &self,
        mutations: &std::collections::BTreeMap<StaticBuffer, KcvMutation>,
    ) -> Result<(), StorageError>;

    /// Validate and take the given lock claims, in order. Any conflict or
    /// failed expectation fails the whole batch.
    fn check_and_claim_locks(&self, claims: &[LockClaim]) -> Result<(), StorageError>;

    /// Release claims previously taken by [`Self::check_and_claim_locks`].
    fn release_locks(&self, claims: &[LockClaim]);

    fn close(&self) {}
}

/// Hint accompanying a mixed-index operation: the owning element's state at
/// derivation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MixedMutationHint {
    pub is_new: bool,
    pub is_removed: bool,
}

/// One document-level operation against a mixed-index backend.
#[derive(Debug, Clone)]
pub struct MixedIndexOp {
    /// Document store within the backend (by element category).
    pub store: String,
    pub doc_id: String,
    pub field: String,
    pub value: PropertyValue,
    pub kind: IndexMutationKind,
    pub hint: MixedMutationHint,
}

/// An external (search) index backend. Mutations are collected per commit
/// and applied in one batch; errors are reported per backend and never roll
/// back primary storage.
pub trait MixedIndexBackend: Send + Sync {
    fn name(&self) -> &str;

    fn apply(&self, ops: &[MixedIndexOp]) -> Result<(), IndexError>;

    fn close(&self) {}
}

/// Factory for named append-only logs (transaction log, trigger logs).
pub trait LogManager: Send + Sync {
    fn open_log(&self, name: &str) -> Result<Arc<dyn LogStore>, LogError>;
}

/// Name of the engine's transaction log.
pub const TX_LOG_NAME: &str = "txlog";

/// The full set of storage collaborators behind one graph.
pub struct Backend {
    edge_store: Arc<dyn KeyColumnValueStore>,
    index_store: Arc<dyn KeyColumnValueStore>,
    mixed: FxHashMap<String, Arc<dyn MixedIndexBackend>>,
    logs: Arc<dyn LogManager>,
    /// Memoized handles of opened logs.
    open_logs: Mutex<FxHashMap<String, Arc<dyn LogStore>>>,
    tx_isolation: bool,
}

impl Backend {
    pub fn new(
        edge_store: Arc<dyn KeyColumnValueStore>,
        index_store: Arc<dyn KeyColumnValueStore>,
        mixed: impl IntoIterator<Item = Arc<dyn MixedIndexBackend>>,
        logs: Arc<dyn LogManager>,
        tx_isolation: bool,
    ) -> Self {
        let mixed = mixed
            .into_iter()
            .map(|backend| (backend.name().to_owned(), backend))
            .collect();
        Self {
            edge_store,
            index_store,
            mixed,
            logs,
            open_logs: Mutex::default(),
            tx_isolation,
        }
    }

    /// Whether the primary backend applies a whole transaction atomically.
    /// When false, the commit engine persists schema mutations in a separate
    /// transaction ahead of data.
    pub fn has_tx_isolation(&self) -> bool {
        self.tx_isolation
    }

    pub fn edge_store(&self) -> &Arc<dyn KeyColumnValueStore> {
        &self.edge_store
    }

    pub fn index_store(&self) -> &Arc<dyn KeyColumnValueStore> {
        &self.index_store
    }

    pub fn mixed_backend(&self, name: &str) -> Result<&Arc<dyn MixedIndexBackend>, IndexError> {
        self.mixed
            .get(name)
            .ok_or_else(|| IndexError::UnknownBackend(name.to_owned()))
    }

    /// The named log, opened once and cached.
    pub fn log(&self, name: &str) -> Result<Arc<dyn LogStore>, LogError> {
        let mut open = self.open_logs.lock();
        if let Some(log) = open.get(name) {
            return Ok(log.clone());
        }
        let log = self.logs.open_log(name)?;
        open.insert(name.to_owned(), log.clone());
        Ok(log)
    }

    pub fn begin_tx(self: &Arc<Self>) -> transaction::BackendTransaction {
        transaction::BackendTransaction::new(self.clone())
    }

    /// Close all stores and index backends.
    pub fn close(&self) {
        self.edge_store.close();
        self.index_store.close();
        for backend in self.mixed.values() {
            backend.close();
        }
    }
}
