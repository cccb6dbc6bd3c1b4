//! The per-transaction façade over all storage collaborators.
//!
//! Mutations and lock claims are queued here during prepare and flushed in
//! two phases: [`BackendTransaction::commit_storage`] (primary + composite
//! index stores, with lock validation) strictly before
//! [`BackendTransaction::commit_indexes`] (mixed backends).

use std::collections::BTreeMap;
use std::sync::Arc;

use quiver_codec::{encode_varint, BufWriter};

use crate::error::{IndexError, StorageError};

use super::super::relation::PropertyValue;
use super::super::schema::IndexMutationKind;
use super::super::{Entry, EntryList, StaticBuffer};
use super::{
    Backend, KcvMutation, KeyIterator, KeySliceQuery, LockClaim, MixedIndexBackend, MixedIndexOp,
    MixedMutationHint, ScanOrder, SliceQuery,
};

/// Mixed-index sub-transaction: operations against one external backend,
/// buffered until `commit_indexes`.
pub struct IndexTransaction {
    backend: Arc<dyn MixedIndexBackend>,
    ops: Vec<MixedIndexOp>,
}

impl IndexTransaction {
    fn new(backend: Arc<dyn MixedIndexBackend>) -> Self {
        Self {
            backend,
            ops: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        self.backend.name()
    }

    /// Queue a field addition. `is_new` hints that the owning element's
    /// document does not exist yet (create vs. update).
    pub fn add(&mut self, store: &str, doc_id: String, field: String, value: PropertyValue, is_new: bool) {
        self.ops.push(MixedIndexOp {
            store: store.to_owned(),
            doc_id,
            field,
            value,
            kind: IndexMutationKind::Addition,
            hint: MixedMutationHint {
                is_new,
                is_removed: false,
            },
        });
    }

    /// Queue a field deletion. `is_removed` hints that the whole document
    /// goes away (drop vs. field removal).
    pub fn delete(&mut self, store: &str, doc_id: String, field: String, value: PropertyValue, is_removed: bool) {
        self.ops.push(MixedIndexOp {
            store: store.to_owned(),
            doc_id,
            field,
            value,
            kind: IndexMutationKind::Deletion,
            hint: MixedMutationHint {
                is_new: false,
                is_removed,
            },
        });
    }

    fn commit(&mut self) -> Result<(), IndexError> {
        let result = self.backend.apply(&self.ops);
        self.ops.clear();
        result
    }

    fn rollback(&mut self) {
        self.ops.clear();
    }
}

/// A single logical transaction against a [`Backend`].
pub struct BackendTransaction {
    backend: Arc<Backend>,
    edge_mutations: BTreeMap<StaticBuffer, KcvMutation>,
    index_mutations: BTreeMap<StaticBuffer, KcvMutation>,
    edge_locks: Vec<LockClaim>,
    index_locks: Vec<LockClaim>,
    /// Mixed sub-transactions by backend name; BTreeMap so commit order is
    /// deterministic.
    mixed: BTreeMap<String, IndexTransaction>,
    claims_held: bool,
}

impl BackendTransaction {
    pub(super) fn new(backend: Arc<Backend>) -> Self {
        Self {
            backend,
            edge_mutations: BTreeMap::new(),
            index_mutations: BTreeMap::new(),
            edge_locks: Vec::new(),
            index_locks: Vec::new(),
            mixed: BTreeMap::new(),
            claims_held: false,
        }
    }

    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }

    // --- reads ------------------------------------------------------------

    pub fn edge_store_query(&self, query: &KeySliceQuery) -> Result<EntryList, StorageError> {
        self.backend.edge_store().slice(query)
    }

    pub fn edge_store_multi_query(
        &self,
        keys: &[StaticBuffer],
        slice: &SliceQuery,
    ) -> Result<Vec<(StaticBuffer, EntryList)>, StorageError> {
        self.backend.edge_store().multi_slice(keys, slice)
    }

    pub fn edge_store_keys(&self, filter: &SliceQuery, order: ScanOrder) -> Result<KeyIterator, StorageError> {
        self.backend.edge_store().scan_keys(filter, order)
    }

    // --- queued writes ----------------------------------------------------

    /// Queue primary-store mutations under one vertex key. Preserves
    /// insertion order per key.
    pub fn mutate_edges(&mut self, key: StaticBuffer, additions: Vec<Entry>, deletions: Vec<StaticBuffer>) {
        if additions.is_empty() && deletions.is_empty() {
            return;
        }
        self.edge_mutations.entry(key).or_default().merge(additions, deletions);
    }

    /// Queue composite-index mutations under one bucket key.
    pub fn mutate_index(&mut self, key: StaticBuffer, additions: Vec<Entry>, deletions: Vec<StaticBuffer>) {
        if additions.is_empty() && deletions.is_empty() {
            return;
        }
        self.index_mutations.entry(key).or_default().merge(additions, deletions);
    }

    /// Claim an optimistic lock in the edge store. With `expected`, the
    /// claim also asserts the entry's current value; without, it only
    /// reserves the column.
    pub fn acquire_edge_lock(&mut self, key: StaticBuffer, column: StaticBuffer, expected: Option<StaticBuffer>) {
        self.edge_locks.push(LockClaim { key, column, expected });
    }

    /// Claim an optimistic lock in the composite-index store.
    pub fn acquire_index_lock(&mut self, key: StaticBuffer, column: StaticBuffer, expected: Option<StaticBuffer>) {
        self.index_locks.push(LockClaim { key, column, expected });
    }

    /// The sub-transaction for the named mixed-index backend, created on
    /// first use.
    pub fn index_transaction(&mut self, backend_name: &str) -> Result<&mut IndexTransaction, IndexError> {
        if !self.mixed.contains_key(backend_name) {
            let backend = self.backend.mixed_backend(backend_name)?.clone();
            self.mixed
                .insert(backend_name.to_owned(), IndexTransaction::new(backend));
        }
        Ok(self
            .mixed
            .get_mut(backend_name)
            .expect("sub-transaction inserted above"))
    }

    /// Whether any primary (edge-store) mutation is queued.
    pub fn has_edge_mutations(&self) -> bool {
        !self.edge_mutations.is_empty()
    }

    pub fn has_any_mutations(&self) -> bool {
        !self.edge_mutations.is_empty() || !self.index_mutations.is_empty() || self.mixed.values().any(|tx| !tx.ops.is_empty())
    }

    // --- flush ------------------------------------------------------------

    /// Validate all lock claims and apply the queued KCV mutations: edge
    /// store first, then the composite-index store. Lock contention and
    /// expectation failures surface here, at commit time.
    pub fn commit_storage(&mut self) -> Result<(), StorageError> {
        let edge_store = self.backend.edge_store().clone();
        let index_store = self.backend.index_store().clone();

        edge_store.check_and_claim_locks(&self.edge_locks)?;
        if let Err(e) = index_store.check_and_claim_locks(&self.index_locks) {
            edge_store.release_locks(&self.edge_locks);
            return Err(e);
        }
        self.claims_held = true;

        let result = if self.edge_mutations.is_empty() {
            Ok(())
        } else {
            edge_store.apply(&self.edge_mutations)
        }
        .and_then(|()| {
            if self.index_mutations.is_empty() {
                Ok(())
            } else {
                index_store.apply(&self.index_mutations)
            }
        });

        edge_store.release_locks(&self.edge_locks);
        index_store.release_locks(&self.index_locks);
        self.claims_held = false;

        result?;
        self.edge_mutations.clear();
        self.index_mutations.clear();
        self.edge_locks.clear();
        self.index_locks.clear();
        Ok(())
    }

    /// Commit every mixed-index sub-transaction, collecting per-backend
    /// failures. Never rolls back primary storage.
    pub fn commit_indexes(&mut self) -> Vec<(String, IndexError)> {
        let mut failures = Vec::new();
        for (name, tx) in self.mixed.iter_mut() {
            if let Err(e) = tx.commit() {
                failures.push((name.clone(), e));
            }
        }
        self.mixed.clear();
        failures
    }

    /// Full commit: storage, then indexes, raising on the first index
    /// failure. Used for sub-transactions whose callers treat any failure
    /// as fatal (the schema flush).
    pub fn commit(&mut self) -> Result<(), StorageError> {
        self.commit_storage()?;
        let failures = self.commit_indexes();
        if let Some((index, failure)) = failures.into_iter().next() {
            return Err(StorageError::Backend {
                store: index,
                source: anyhow::Error::new(failure),
            });
        }
        Ok(())
    }

    /// Discard everything queued and release any held claims.
    pub fn rollback(&mut self) -> Result<(), StorageError> {
        if self.claims_held {
            self.backend.edge_store().release_locks(&self.edge_locks);
            self.backend.index_store().release_locks(&self.index_locks);
            self.claims_held = false;
        }
        self.edge_mutations.clear();
        self.index_mutations.clear();
        self.edge_locks.clear();
        self.index_locks.clear();
        for tx in self.mixed.values_mut() {
            tx.rollback();
        }
        self.mixed.clear();
        Ok(())
    }

    // --- logging ----------------------------------------------------------

    /// Serialize the queued KCV mutations into `out` in a deterministic
    /// form; this is the opaque payload of a transaction-log record.
    ///
    /// ```text
    /// for each of [edge section, index section]:
    ///   <key_count(varint)>
    ///   per key: <key> <addition_count> [<column><value><ttl?>...]
    ///                  <deletion_count> [<column>...]   (all length-prefixed)
    /// ```
    pub fn log_mutations(&self, out: &mut impl BufWriter) {
        for section in [&self.edge_mutations, &self.index_mutations] {
            encode_varint(section.len() as u64, out);
            for (key, mutation) in section {
                put_buf(out, key);
                encode_varint(mutation.additions.len() as u64, out);
                for entry in &mutation.additions {
                    put_buf(out, &entry.column);
                    put_buf(out, &entry.value);
                    match entry.ttl_seconds {
                        None => out.put_u8(0),
                        Some(ttl) => {
                            out.put_u8(1);
                            out.put_u32(ttl);
                        }
                    }
                }
                encode_varint(mutation.deletions.len() as u64, out);
                for column in &mutation.deletions {
                    put_buf(out, column);
                }
            }
        }
    }
}

fn put_buf(out: &mut impl BufWriter, buf: &[u8]) {
    encode_varint(buf.len() as u64, out);
    out.put_slice(buf);
}
