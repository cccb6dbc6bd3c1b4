//! The graph engine handle and its transactions.
//!
//! [`GraphDb`] owns the shared state of one open graph: the backend, id
//! machinery, schema cache, and the process registry entry. [`GraphTx`]
//! carries one transaction's arena of vertices/relations, its configuration,
//! and its [`BackendTransaction`]. The commit pipeline itself lives in
//! [`super::commit`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use rustc_hash::FxHashSet;

use crate::config::{GraphConfig, TimestampProvider, TxConfig};
use crate::error::{GraphError, InvariantViolation, StorageError};

use super::backend::transaction::BackendTransaction;
use super::backend::{Backend, KeySliceQuery, ScanOrder, SliceQuery};
use super::edge_codec::EdgeCodec;
use super::id::{IdAssigner, IdManager};
use super::index_codec::IndexCodec;
use super::registry::{InstanceGuard, InstanceRegistry};
use super::relation::{Lifecycle, PropertyValue, RelationSlot, TxGraph, VertexSlot};
use super::schema::{Direction, RelationTypeSchema};
use super::schema_cache::{SchemaCache, SchemaRetriever};
use super::{EntryList, RelationId, VertexId};

pub(super) struct GraphInner {
    pub(super) config: GraphConfig,
    pub(super) backend: Arc<Backend>,
    pub(super) id_manager: IdManager,
    pub(super) id_assigner: IdAssigner,
    pub(super) edge_codec: EdgeCodec,
    pub(super) index_codec: IndexCodec,
    pub(super) schema_cache: SchemaCache,
    pub(super) retriever: Arc<dyn SchemaRetriever>,
    pub(super) timestamps: Arc<dyn TimestampProvider>,
    pub(super) open_txs: Arc<Mutex<FxHashSet<u64>>>,
    pub(super) tx_uid_counter: AtomicU64,
    /// Monotonic per-process transaction-log id.
    pub(super) tx_log_counter: AtomicU64,
    pub(super) instance_guard: Mutex<Option<InstanceGuard>>,
    pub(super) closed: AtomicBool,
}

/// Handle to one open graph. Clones share state.
#[derive(Clone)]
pub struct GraphDb {
    pub(super) inner: Arc<GraphInner>,
}

impl std::fmt::Debug for GraphDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphDb").finish_non_exhaustive()
    }
}

impl GraphDb {
    /// Open a graph over `backend`, registering its instance id.
    pub fn open(
        config: GraphConfig,
        backend: Arc<Backend>,
        registry: &InstanceRegistry,
        retriever: Arc<dyn SchemaRetriever>,
        timestamps: Arc<dyn TimestampProvider>,
    ) -> Result<Self, GraphError> {
        let guard = registry.register(&config.unique_instance_id, timestamps.time())?;
        log::info!("opened graph instance `{}`", config.unique_instance_id);
        let id_assigner = IdAssigner::new(config.id_block_size);
        Ok(Self {
            inner: Arc::new(GraphInner {
                config,
                backend,
                id_manager: IdManager::default(),
                id_assigner,
                edge_codec: EdgeCodec,
                index_codec: IndexCodec::default(),
                schema_cache: SchemaCache::new(),
                retriever,
                timestamps,
                open_txs: Arc::new(Mutex::new(FxHashSet::default())),
                tx_uid_counter: AtomicU64::new(0),
                tx_log_counter: AtomicU64::new(0),
                instance_guard: Mutex::new(Some(guard)),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn config(&self) -> &GraphConfig {
        &self.inner.config
    }

    pub fn id_manager(&self) -> &IdManager {
        &self.inner.id_manager
    }

    pub fn edge_codec(&self) -> &EdgeCodec {
        &self.inner.edge_codec
    }

    pub fn backend(&self) -> &Arc<Backend> {
        &self.inner.backend
    }

    fn ensure_open(&self) -> Result<(), GraphError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(GraphError::Closed);
        }
        Ok(())
    }

    /// Start a transaction with the given per-transaction configuration.
    pub fn begin_tx(&self, config: TxConfig) -> Result<GraphTx, GraphError> {
        self.ensure_open()?;
        let uid = self.inner.tx_uid_counter.fetch_add(1, Ordering::Relaxed) + 1;
        self.inner.open_txs.lock().insert(uid);
        Ok(GraphTx {
            inner: self.inner.clone(),
            graph: TxGraph::new(),
            added: Vec::new(),
            removed: Vec::new(),
            config,
            mutator: self.inner.backend.begin_tx(),
            uid,
            completed: false,
        })
    }

    /// Abort `tx`, discarding everything it queued.
    pub fn rollback_tx(&self, tx: &mut GraphTx) {
        if tx.completed {
            return;
        }
        tx.completed = true;
        if let Err(e) = tx.mutator.rollback() {
            log::warn!("rollback of tx {} reported: {e}", tx.uid);
        }
        self.inner.open_txs.lock().remove(&tx.uid);
    }

    /// Number of transactions begun but neither committed nor rolled back.
    pub fn open_tx_count(&self) -> usize {
        self.inner.open_txs.lock().len()
    }

    // --- global reads -----------------------------------------------------

    /// Enumerate all vertex ids, using the existence slice to exclude
    /// non-vertex keys. Prefers an unordered scan; falls back to an ordered
    /// full-range scan; fails if the backend supports neither.
    pub fn get_vertex_ids(&self, tx: &GraphTx) -> Result<Vec<VertexId>, StorageError> {
        let features = self.inner.backend.edge_store().features();
        let order = if features.unordered_scan {
            ScanOrder::Unordered
        } else if features.ordered_scan {
            ScanOrder::Ordered
        } else {
            return Err(StorageError::Unsupported(
                "vertex enumeration requires an ordered or unordered key scan",
            ));
        };
        let existence = self.inner.edge_codec.vertex_existence_query();
        let keys = tx.mutator.edge_store_keys(&existence, order)?;
        let mut ids = Vec::new();
        for key in keys {
            let key = key?;
            let id = self.inner.id_manager.get_key_id(&key).map_err(|e| StorageError::Backend {
                store: self.inner.backend.edge_store().name().to_owned(),
                source: anyhow::Error::new(e).context("malformed vertex key in scan"),
            })?;
            ids.push(id);
        }
        Ok(ids)
    }

    /// Slice one vertex's adjacency.
    pub fn edge_query(
        &self,
        vertex: VertexId,
        slice: &SliceQuery,
        tx: &GraphTx,
    ) -> Result<EntryList, GraphError> {
        if !vertex.is_assigned() {
            return Err(InvariantViolation::NonPositiveVertexId(vertex).into());
        }
        let query = KeySliceQuery {
            key: self.inner.id_manager.get_key(vertex),
            slice: slice.clone(),
        };
        Ok(tx.mutator.edge_store_query(&query)?)
    }

    /// Slice several vertices' adjacencies in one backend round trip.
    pub fn edge_multi_query(
        &self,
        vertices: &[VertexId],
        slice: &SliceQuery,
        tx: &GraphTx,
    ) -> Result<Vec<(VertexId, EntryList)>, GraphError> {
        let mut keys = Vec::with_capacity(vertices.len());
        for vertex in vertices {
            if !vertex.is_assigned() {
                return Err(InvariantViolation::NonPositiveVertexId(*vertex).into());
            }
            keys.push(self.inner.id_manager.get_key(*vertex));
        }
        let results = tx.mutator.edge_store_multi_query(&keys, slice)?;
        results
            .into_iter()
            .map(|(key, entries)| {
                let id = self.inner.id_manager.get_key_id(&key).map_err(|e| {
                    GraphError::Storage(StorageError::Backend {
                        store: self.inner.backend.edge_store().name().to_owned(),
                        source: anyhow::Error::new(e).context("malformed vertex key in multi-slice"),
                    })
                })?;
                Ok((id, entries))
            })
            .collect()
    }

    // --- schema lookups ---------------------------------------------------

    /// Resolve a schema vertex by name through the shared cache.
    pub fn schema_by_name(&self, name: &str) -> Result<Option<VertexId>, StorageError> {
        self.inner
            .schema_cache
            .schema_by_name(name, self.inner.retriever.as_ref())
    }

    /// Resolve a schema vertex's adjacency through the shared cache.
    pub fn schema_relations(
        &self,
        schema_id: VertexId,
        type_id: super::TypeId,
        dir: Direction,
    ) -> Result<EntryList, StorageError> {
        self.inner
            .schema_cache
            .schema_relations(schema_id, type_id, dir, self.inner.retriever.as_ref())
    }

    // --- shutdown ---------------------------------------------------------

    /// Close the graph: unregister the instance id, close the id assigner
    /// and backend, and drop the caches. Idempotent.
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let open = self.open_tx_count();
        if open > 0 {
            log::warn!(
                "shutting down graph `{}` with {open} open transaction(s)",
                self.inner.config.unique_instance_id
            );
        }
        self.inner.schema_cache.clear();
        self.inner.id_assigner.close();
        self.inner.backend.close();
        // Releasing the guard unregisters the instance id.
        self.inner.instance_guard.lock().take();
        log::info!("closed graph instance `{}`", self.inner.config.unique_instance_id);
    }
}

/// One transaction: an arena of vertices/relations plus the queued backend
/// state. Obtain from [`GraphDb::begin_tx`]; finish with
/// [`GraphDb::commit_tx`] or [`GraphDb::rollback_tx`].
pub struct GraphTx {
    pub(super) inner: Arc<GraphInner>,
    pub(super) graph: TxGraph,
    pub(super) added: Vec<RelationSlot>,
    pub(super) removed: Vec<RelationSlot>,
    pub(super) config: TxConfig,
    pub(super) mutator: BackendTransaction,
    pub(super) uid: u64,
    pub(super) completed: bool,
}

impl std::fmt::Debug for GraphTx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphTx").finish_non_exhaustive()
    }
}

impl GraphTx {
    pub fn graph(&self) -> &TxGraph {
        &self.graph
    }

    pub fn config(&self) -> &TxConfig {
        &self.config
    }

    /// Create a new vertex; its id is assigned at commit (or immediately,
    /// under `assign_ids_immediately`).
    pub fn create_vertex(&mut self) -> VertexSlot {
        self.graph.new_vertex(None, Lifecycle::New)
    }

    /// Create a new vertex with a caller-chosen id. Requires
    /// `allow_setting_vertex_id` in the graph configuration.
    pub fn create_vertex_with_id(&mut self, id: VertexId) -> Result<VertexSlot, InvariantViolation> {
        if !self.inner.config.allow_setting_vertex_id {
            return Err(InvariantViolation::SettingVertexIdDisallowed);
        }
        if !id.is_assigned() {
            return Err(InvariantViolation::NonPositiveVertexId(id));
        }
        let slot = self.graph.new_vertex(None, Lifecycle::New);
        self.graph.vertex_mut(slot).id = id;
        Ok(slot)
    }

    /// Create a new schema vertex (id from the schema space).
    pub fn create_schema_vertex(&mut self, label: Option<String>) -> VertexSlot {
        self.graph.new_schema_vertex(label, Lifecycle::New)
    }

    /// Reference a vertex that already exists in storage.
    pub fn reference_vertex(&mut self, id: VertexId) -> Result<VertexSlot, InvariantViolation> {
        if !id.is_assigned() {
            return Err(InvariantViolation::NonPositiveVertexId(id));
        }
        Ok(self.graph.existing_vertex(id))
    }

    /// Record a new property relation for commit.
    pub fn add_property(
        &mut self,
        ty: Arc<RelationTypeSchema>,
        vertex: VertexSlot,
        value: PropertyValue,
    ) -> Result<RelationSlot, InvariantViolation> {
        let slot = self.graph.new_property(ty, vertex, value, Lifecycle::New);
        self.record_added(slot)?;
        Ok(slot)
    }

    /// Record a new edge relation for commit.
    pub fn add_edge(
        &mut self,
        ty: Arc<RelationTypeSchema>,
        out: VertexSlot,
        in_: VertexSlot,
        payload: Bytes,
    ) -> Result<RelationSlot, InvariantViolation> {
        let slot = self.graph.new_edge(ty, out, in_, payload, Lifecycle::New);
        self.record_added(slot)?;
        Ok(slot)
    }

    fn record_added(&mut self, slot: RelationSlot) -> Result<(), InvariantViolation> {
        if self.config.assign_ids_immediately {
            self.inner.id_assigner.assign_relation_id(&mut self.graph, slot)?;
        }
        self.added.push(slot);
        Ok(())
    }

    /// Record the removal of an existing property (identified by its
    /// permanent relation id and value).
    pub fn remove_property(
        &mut self,
        ty: Arc<RelationTypeSchema>,
        vertex: VertexSlot,
        value: PropertyValue,
        id: RelationId,
    ) -> Result<RelationSlot, InvariantViolation> {
        if !id.is_assigned() {
            return Err(InvariantViolation::RelationIdUnassigned);
        }
        let slot = self.graph.new_property(ty, vertex, value, Lifecycle::Removed);
        self.graph.relation_mut(slot).id = id;
        self.removed.push(slot);
        Ok(slot)
    }

    /// Record the removal of an existing edge.
    pub fn remove_edge(
        &mut self,
        ty: Arc<RelationTypeSchema>,
        out: VertexSlot,
        in_: VertexSlot,
        payload: Bytes,
        id: RelationId,
    ) -> Result<RelationSlot, InvariantViolation> {
        if !id.is_assigned() {
            return Err(InvariantViolation::RelationIdUnassigned);
        }
        let slot = self.graph.new_edge(ty, out, in_, payload, Lifecycle::Removed);
        self.graph.relation_mut(slot).id = id;
        self.removed.push(slot);
        Ok(slot)
    }

    pub fn has_modifications(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }
}

impl Drop for GraphTx {
    fn drop(&mut self) {
        if !self.completed {
            self.inner.open_txs.lock().remove(&self.uid);
        }
    }
}

/// A [`SchemaRetriever`] that resolves nothing; for graphs whose schema is
/// provided entirely by the caller.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSchemaRetriever;

impl SchemaRetriever for NoSchemaRetriever {
    fn retrieve_schema_by_name(&self, _name: &str) -> Result<Option<VertexId>, StorageError> {
        Ok(None)
    }

    fn retrieve_schema_relations(
        &self,
        _schema_id: VertexId,
        _type_id: super::TypeId,
        _dir: Direction,
    ) -> Result<EntryList, StorageError> {
        Ok(Vec::new())
    }
}
