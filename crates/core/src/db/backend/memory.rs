//! In-memory reference implementations of the backend contracts.
//!
//! These back the engine's tests and double as the `inmemory` storage
//! option. All implementations share an optional [`Journal`] recording the
//! externally-observable calls (lock claims, applies) in order, which is
//! what the commit-ordering assertions inspect.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};

use quiver_txlog::{LogError, LogStore, MemoryLog};

use crate::error::{IndexError, StorageError};

use super::super::relation::PropertyValue;
use super::super::schema::IndexMutationKind;
use super::super::{Entry, EntryList, StaticBuffer};
use super::{
    Backend, KcvMutation, KeyIterator, KeySliceQuery, LockClaim, LogManager, MixedIndexBackend,
    MixedIndexOp, ScanOrder, SliceQuery, StoreFeatures,
};

/// One externally-observable backend call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    LockClaimed {
        store: String,
        key: StaticBuffer,
        column: StaticBuffer,
        with_expectation: bool,
    },
    MutationsApplied {
        store: String,
        keys: Vec<StaticBuffer>,
    },
    MixedApplied {
        backend: String,
        ops: usize,
    },
}

/// Shared, ordered record of backend calls.
#[derive(Clone, Default)]
pub struct Journal {
    events: Arc<Mutex<Vec<BackendEvent>>>,
}

impl Journal {
    pub fn record(&self, event: BackendEvent) {
        self.events.lock().push(event);
    }

    pub fn events(&self) -> Vec<BackendEvent> {
        self.events.lock().clone()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct StoredCell {
    value: StaticBuffer,
    ttl_seconds: Option<u32>,
}

/// Ordered in-memory key-column-value store.
pub struct MemoryStore {
    name: String,
    features: StoreFeatures,
    rows: RwLock<BTreeMap<StaticBuffer, BTreeMap<StaticBuffer, StoredCell>>>,
    locks: Mutex<FxHashSet<(StaticBuffer, StaticBuffer)>>,
    journal: Journal,
    fail_next_apply: AtomicBool,
}

impl MemoryStore {
    pub fn new(name: impl Into<String>, journal: Journal) -> Self {
        Self {
            name: name.into(),
            features: StoreFeatures {
                ordered_scan: true,
                unordered_scan: true,
            },
            rows: RwLock::default(),
            locks: Mutex::default(),
            journal,
            fail_next_apply: AtomicBool::new(false),
        }
    }

    /// Restrict the advertised scan capabilities (for exercising the
    /// global-read fallbacks).
    pub fn with_features(mut self, features: StoreFeatures) -> Self {
        self.features = features;
        self
    }

    /// Make the next `apply` fail with a backend error.
    pub fn fail_next_apply(&self) {
        self.fail_next_apply.store(true, Ordering::SeqCst);
    }

    /// All entries under `key`, for test inspection.
    pub fn entries_of(&self, key: &[u8]) -> EntryList {
        self.rows
            .read()
            .get(key)
            .map(|columns| {
                columns
                    .iter()
                    .map(|(column, cell)| Entry {
                        column: column.clone(),
                        value: cell.value.clone(),
                        ttl_seconds: cell.ttl_seconds,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn key_count(&self) -> usize {
        self.rows.read().len()
    }
}

impl super::KeyColumnValueStore for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn features(&self) -> StoreFeatures {
        self.features
    }

    fn slice(&self, query: &KeySliceQuery) -> Result<EntryList, StorageError> {
        let rows = self.rows.read();
        let mut entries = Vec::new();
        if let Some(columns) = rows.get(&query.key) {
            for (column, cell) in columns.range(query.slice.start.clone()..query.slice.end.clone()) {
                if query.slice.limit.is_some_and(|limit| entries.len() >= limit) {
                    break;
                }
                entries.push(Entry {
                    column: column.clone(),
                    value: cell.value.clone(),
                    ttl_seconds: cell.ttl_seconds,
                });
            }
        }
        Ok(entries)
    }

    fn multi_slice(
        &self,
        keys: &[StaticBuffer],
        slice: &SliceQuery,
    ) -> Result<Vec<(StaticBuffer, EntryList)>, StorageError> {
        keys.iter()
            .map(|key| {
                self.slice(&KeySliceQuery {
                    key: key.clone(),
                    slice: slice.clone(),
                })
                .map(|entries| (key.clone(), entries))
            })
            .collect()
    }

    fn scan_keys(&self, filter: &SliceQuery, order: ScanOrder) -> Result<KeyIterator, StorageError> {
        match order {
            ScanOrder::Ordered if !self.features.ordered_scan => {
                return Err(StorageError::Unsupported("ordered key scan"))
            }
            ScanOrder::Unordered if !self.features.unordered_scan => {
                return Err(StorageError::Unsupported("unordered key scan"))
            }
            _ => {}
        }
        let rows = self.rows.read();
        let keys: Vec<StaticBuffer> = rows
            .iter()
            .filter(|(_, columns)| {
                columns
                    .range(filter.start.clone()..filter.end.clone())
                    .next()
                    .is_some()
            })
            .map(|(key, _)| key.clone())
            .collect();
        Ok(Box::new(keys.into_iter().map(Ok::<_, StorageError>)))
    }

    fn apply(&self, mutations: &BTreeMap<StaticBuffer, KcvMutation>) -> Result<(), StorageError> {
        if self.fail_next_apply.swap(false, Ordering::SeqCst) {
            return Err(StorageError::Backend {
                store: self.name.clone(),
                source: anyhow::anyhow!("apply failure injected"),
            });
        }
        let mut rows = self.rows.write();
        for (key, mutation) in mutations {
            let columns = rows.entry(key.clone()).or_default();
            for column in &mutation.deletions {
                columns.remove(column);
            }
            for entry in &mutation.additions {
                columns.insert(
                    entry.column.clone(),
                    StoredCell {
                        value: entry.value.clone(),
                        ttl_seconds: entry.ttl_seconds,
                    },
                );
            }
            if columns.is_empty() {
                rows.remove(key);
            }
        }
        self.journal.record(BackendEvent::MutationsApplied {
            store: self.name.clone(),
            keys: mutations.keys().cloned().collect(),
        });
        Ok(())
    }

    fn check_and_claim_locks(&self, claims: &[LockClaim]) -> Result<(), StorageError> {
        let rows = self.rows.read();
        let mut locks = self.locks.lock();
        // Validate the whole batch before claiming any of it.
        for claim in claims {
            if locks.contains(&(claim.key.clone(), claim.column.clone())) {
                return Err(StorageError::LockContention {
                    store: self.name.clone(),
                    key: claim.key.clone(),
                    column: claim.column.clone(),
                });
            }
            if let Some(expected) = &claim.expected {
                let current = rows
                    .get(&claim.key)
                    .and_then(|columns| columns.get(&claim.column))
                    .map(|cell| &cell.value);
                if current != Some(expected) {
                    return Err(StorageError::ExpectationFailed {
                        store: self.name.clone(),
                        key: claim.key.clone(),
                        column: claim.column.clone(),
                    });
                }
            }
        }
        for claim in claims {
            locks.insert((claim.key.clone(), claim.column.clone()));
            self.journal.record(BackendEvent::LockClaimed {
                store: self.name.clone(),
                key: claim.key.clone(),
                column: claim.column.clone(),
                with_expectation: claim.expected.is_some(),
            });
        }
        Ok(())
    }

    fn release_locks(&self, claims: &[LockClaim]) {
        let mut locks = self.locks.lock();
        for claim in claims {
            locks.remove(&(claim.key.clone(), claim.column.clone()));
        }
    }
}

/// In-memory mixed-index backend: documents of `(store, doc_id)` with
/// field/value pairs.
pub struct MemoryMixedIndex {
    name: String,
    docs: RwLock<FxHashMap<(String, String), FxHashMap<String, PropertyValue>>>,
    journal: Journal,
    fail_applies: AtomicBool,
}

impl MemoryMixedIndex {
    pub fn new(name: impl Into<String>, journal: Journal) -> Self {
        Self {
            name: name.into(),
            docs: RwLock::default(),
            journal,
            fail_applies: AtomicBool::new(false),
        }
    }

    /// Make every subsequent apply fail.
    pub fn set_fail_applies(&self, fail: bool) {
        self.fail_applies.store(fail, Ordering::SeqCst);
    }

    pub fn document(&self, store: &str, doc_id: &str) -> Option<FxHashMap<String, PropertyValue>> {
        self.docs
            .read()
            .get(&(store.to_owned(), doc_id.to_owned()))
            .cloned()
    }
}

impl MixedIndexBackend for MemoryMixedIndex {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, ops: &[MixedIndexOp]) -> Result<(), IndexError> {
        if self.fail_applies.load(Ordering::SeqCst) {
            return Err(IndexError::Backend {
                index: self.name.clone(),
                source: anyhow::anyhow!("mixed-index failure injected"),
            });
        }
        let mut docs = self.docs.write();
        for op in ops {
            let doc_key = (op.store.clone(), op.doc_id.clone());
            match op.kind {
                IndexMutationKind::Addition => {
                    docs.entry(doc_key).or_default().insert(op.field.clone(), op.value.clone());
                }
                IndexMutationKind::Deletion => {
                    if op.hint.is_removed {
                        docs.remove(&doc_key);
                    } else if let Some(fields) = docs.get_mut(&doc_key) {
                        fields.remove(&op.field);
                        if fields.is_empty() {
                            docs.remove(&doc_key);
                        }
                    }
                }
            }
        }
        self.journal.record(BackendEvent::MixedApplied {
            backend: self.name.clone(),
            ops: ops.len(),
        });
        Ok(())
    }
}

/// Creates (and remembers) one [`MemoryLog`] per name.
#[derive(Default)]
pub struct MemoryLogManager {
    logs: Mutex<FxHashMap<String, MemoryLog>>,
}

impl MemoryLogManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// The named log, if it has been opened.
    pub fn log(&self, name: &str) -> Option<MemoryLog> {
        self.logs.lock().get(name).cloned()
    }
}

impl LogManager for MemoryLogManager {
    fn open_log(&self, name: &str) -> Result<Arc<dyn LogStore>, LogError> {
        let mut logs = self.logs.lock();
        let log = logs
            .entry(name.to_owned())
            .or_insert_with(|| MemoryLog::new(name))
            .clone();
        Ok(Arc::new(log))
    }
}

/// Handles to the pieces of a [`memory_backend`], for tests and tooling.
pub struct MemoryBackendHandles {
    pub journal: Journal,
    pub edge_store: Arc<MemoryStore>,
    pub index_store: Arc<MemoryStore>,
    pub mixed: Vec<Arc<MemoryMixedIndex>>,
    pub logs: Arc<MemoryLogManager>,
}

/// A fully in-memory [`Backend`] with the given mixed-index backends.
pub fn memory_backend(tx_isolation: bool, mixed_names: &[&str]) -> (Arc<Backend>, MemoryBackendHandles) {
    let journal = Journal::default();
    let edge_store = Arc::new(MemoryStore::new("edgestore", journal.clone()));
    let index_store = Arc::new(MemoryStore::new("graphindex", journal.clone()));
    let mixed: Vec<Arc<MemoryMixedIndex>> = mixed_names
        .iter()
        .map(|name| Arc::new(MemoryMixedIndex::new(*name, journal.clone())))
        .collect();
    let logs = Arc::new(MemoryLogManager::new());

    let backend = Arc::new(Backend::new(
        edge_store.clone(),
        index_store.clone(),
        mixed.iter().map(|m| m.clone() as Arc<dyn MixedIndexBackend>),
        logs.clone(),
        tx_isolation,
    ));
    (
        backend,
        MemoryBackendHandles {
            journal,
            edge_store,
            index_store,
            mixed,
            logs,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::super::KeyColumnValueStore;
    use super::*;
    use bytes::Bytes;

    fn entry(column: &'static [u8], value: &'static [u8]) -> Entry {
        Entry::new(Bytes::from_static(column), Bytes::from_static(value))
    }

    fn mutation_map(key: &'static [u8], mutation: KcvMutation) -> BTreeMap<StaticBuffer, KcvMutation> {
        BTreeMap::from([(Bytes::from_static(key), mutation)])
    }

    #[test]
    fn slice_respects_range_and_limit() {
        let store = MemoryStore::new("s", Journal::default());
        store
            .apply(&mutation_map(
                b"k",
                KcvMutation {
                    additions: vec![entry(b"a", b"1"), entry(b"b", b"2"), entry(b"c", b"3")],
                    deletions: vec![],
                },
            ))
            .unwrap();

        let query = KeySliceQuery {
            key: Bytes::from_static(b"k"),
            slice: SliceQuery::new(Bytes::from_static(b"a"), Bytes::from_static(b"c")).with_limit(1),
        };
        let entries = store.slice(&query).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].column, Bytes::from_static(b"a"));
    }

    #[test]
    fn deletions_apply_before_additions() {
        let store = MemoryStore::new("s", Journal::default());
        store
            .apply(&mutation_map(
                b"k",
                KcvMutation {
                    additions: vec![entry(b"a", b"old")],
                    deletions: vec![],
                },
            ))
            .unwrap();
        // Delete and re-add the same column in one batch: the addition wins.
        store
            .apply(&mutation_map(
                b"k",
                KcvMutation {
                    additions: vec![entry(b"a", b"new")],
                    deletions: vec![Bytes::from_static(b"a")],
                },
            ))
            .unwrap();
        assert_eq!(store.entries_of(b"k")[0].value, Bytes::from_static(b"new"));
    }

    #[test]
    fn lock_claims_conflict_and_expectations_check() {
        let store = MemoryStore::new("s", Journal::default());
        store
            .apply(&mutation_map(
                b"k",
                KcvMutation {
                    additions: vec![entry(b"a", b"1")],
                    deletions: vec![],
                },
            ))
            .unwrap();

        let claim = LockClaim {
            key: Bytes::from_static(b"k"),
            column: Bytes::from_static(b"a"),
            expected: Some(Bytes::from_static(b"1")),
        };
        store.check_and_claim_locks(std::slice::from_ref(&claim)).unwrap();

        // Second claim on the held column conflicts.
        let err = store
            .check_and_claim_locks(&[LockClaim {
                expected: None,
                ..claim.clone()
            }])
            .unwrap_err();
        assert!(matches!(err, StorageError::LockContention { .. }));

        store.release_locks(std::slice::from_ref(&claim));

        // Wrong expectation fails even without contention.
        let err = store
            .check_and_claim_locks(&[LockClaim {
                expected: Some(Bytes::from_static(b"other")),
                ..claim
            }])
            .unwrap_err();
        assert!(matches!(err, StorageError::ExpectationFailed { .. }));
    }

    #[test]
    fn mixed_index_document_lifecycle() {
        let index = MemoryMixedIndex::new("search", Journal::default());
        let add = MixedIndexOp {
            store: "vertex".into(),
            doc_id: "d1".into(),
            field: "name".into(),
            value: PropertyValue::from("a"),
            kind: IndexMutationKind::Addition,
            hint: super::super::MixedMutationHint {
                is_new: true,
                is_removed: false,
            },
        };
        index.apply(std::slice::from_ref(&add)).unwrap();
        assert!(index.document("vertex", "d1").is_some());

        let del = MixedIndexOp {
            kind: IndexMutationKind::Deletion,
            hint: super::super::MixedMutationHint {
                is_new: false,
                is_removed: true,
            },
            ..add
        };
        index.apply(&[del]).unwrap();
        assert!(index.document("vertex", "d1").is_none());
    }
}
