//! The commit pipeline: prepare, lock, flush, log.
//!
//! A commit runs in two phases. *Prepare* is pure bookkeeping: relations are
//! grouped per vertex, index updates derived, and lock claims queued on the
//! mutator in a fixed order (edge deletions, edge additions, composite-index
//! deletions, composite-index additions). *Flush* then pushes everything
//! out: on backends without transactional isolation, schema mutations go
//! through a dedicated sub-transaction first; the data flush follows as
//! `commit_storage` (primary + composite stores, validating the queued lock
//! claims) strictly before `commit_indexes` (mixed backends), with
//! transaction-log records bracketing each step.
//!
//! Failure semantics are deliberately asymmetric: storage failures roll the
//! transaction back, index failures do not (primary storage is already
//! durable), trigger-log failures only get logged, and the closing trailer
//! is appended no matter what — when the trailer append itself fails after
//! an earlier failure, both errors surface chained.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;

use itertools::Itertools as _;
use quiver_codec::encode_varint;
use quiver_txlog::{ConfigBlock, FailureInfo, LogError, LogStatus, TriggerEntry, TriggerRecord, TxLogHeader, TxLogTrailer};

use crate::config::TxConfig;
use crate::error::{CommitError, IndexError, InvariantViolation};

use super::backend::transaction::BackendTransaction;
use super::backend::TX_LOG_NAME;
use super::edge_codec::primary_entry;
use super::graph::{GraphDb, GraphTx};
use super::relation::{Relation, RelationSlot, TxGraph, VertexSlot};
use super::schema::{
    Cardinality, ConsistencyModifier, Direction, IndexMutationKind, IndexUpdate, Multiplicity,
    SchemaStatus,
};
use super::VertexId;

/// Which relations a prepare pass considers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelationFilter {
    /// Everything (isolated backends take schema and data in one shot).
    All,
    /// Only schema mutations (base type on a schema vertex).
    SchemaOnly,
    /// Everything but schema mutations.
    DataOnly,
}

impl RelationFilter {
    fn matches(self, is_schema: bool) -> bool {
        match self {
            RelationFilter::All => true,
            RelationFilter::SchemaOnly => is_schema,
            RelationFilter::DataOnly => !is_schema,
        }
    }
}

impl GraphDb {
    /// Commit `tx`. On storage-class failures the transaction is rolled
    /// back; index failures leave the durable primary state in place and
    /// are reported in the returned error and the log trailer.
    pub fn commit_tx(&self, tx: &mut GraphTx) -> Result<(), CommitError> {
        if tx.completed {
            return Ok(());
        }
        tx.completed = true;
        let uid = tx.uid;
        let open_txs = self.inner.open_txs.clone();
        // The transaction leaves the open set however commit exits.
        let _release = scopeguard::guard((), move |()| {
            open_txs.lock().remove(&uid);
        });

        let result = self.commit_inner(tx);
        if let Err(err) = &result {
            if err.requires_rollback() {
                if let Err(rollback_err) = tx.mutator.rollback() {
                    log::warn!("rollback after failed commit also failed: {rollback_err}");
                }
            }
        }
        result
    }

    fn commit_inner(&self, tx: &mut GraphTx) -> Result<(), CommitError> {
        if !tx.has_modifications() {
            return Ok(());
        }

        // 1. Finalize the commit timestamp and take a log id.
        let commit_time = match tx.config.commit_time {
            Some(time) => time,
            None => self.inner.timestamps.time(),
        };
        tx.config.commit_time = Some(commit_time);
        let tx_id = self.inner.tx_log_counter.fetch_add(1, Ordering::SeqCst) + 1;

        // 2. Permanent ids for everything NEW (no-op when assigned eagerly).
        self.inner.id_assigner.assign_ids(&mut tx.graph, &tx.added)?;

        // 3. Schema split.
        let has_schema_ops = tx
            .added
            .iter()
            .chain(tx.removed.iter())
            .any(|&slot| self.is_schema_relation(&tx.graph, slot));

        log::debug!(
            "committing tx {tx_id}: {} added, {} removed, schema_ops={has_schema_ops}",
            tx.added.len(),
            tx.removed.len()
        );

        self.flush(tx, commit_time, tx_id, has_schema_ops)
    }

    fn is_schema_relation(&self, graph: &TxGraph, slot: RelationSlot) -> bool {
        let relation = graph.relation(slot);
        relation.ty.base
            && self
                .inner
                .id_manager
                .inspector()
                .is_schema_id(graph.vertex(relation.vertex(0)).id)
    }

    // --- phase 5: flush ---------------------------------------------------

    fn flush(
        &self,
        tx: &mut GraphTx,
        commit_time: i64,
        tx_id: u64,
        has_schema_ops: bool,
    ) -> Result<(), CommitError> {
        let logging = self.inner.config.log_transactions;
        let isolated = self.inner.backend.has_tx_isolation();

        // Schema mutations flush first, in their own transaction, when the
        // backend cannot give us isolation for the combined commit.
        if !isolated && has_schema_ops {
            if !tx.config.acquire_locks {
                return Err(InvariantViolation::SchemaWithoutLocks.into());
            }
            if tx.config.batch_loading {
                return Err(InvariantViolation::SchemaWithBatchLoading.into());
            }
            let mut schema_mutator = self.inner.backend.begin_tx();
            self.prepare_commit(
                &tx.graph,
                &tx.added,
                &tx.removed,
                RelationFilter::SchemaOnly,
                &mut schema_mutator,
                true,
            )?;
            if logging {
                self.append_tx_record(
                    tx_id,
                    commit_time,
                    LogStatus::PreflushSystem,
                    Some(&tx.config),
                    &schema_mutator,
                )?;
            }
            let commit_result = schema_mutator.commit();
            let status = if commit_result.is_ok() {
                LogStatus::SuccessSystem
            } else {
                LogStatus::FailureSystem
            };
            // The system trailer is written whether the schema commit
            // succeeded or not.
            let trailer_result = if logging {
                self.append_trailer(&TxLogTrailer::closing(tx_id, commit_time, status))
            } else {
                Ok(())
            };
            if let Err(storage_err) = commit_result {
                let commit_err = CommitError::Storage(storage_err);
                return Err(match trailer_result {
                    Err(log_err) => CommitError::TrailerAfterFailure {
                        trailer: log_err,
                        source: Box::new(commit_err),
                    },
                    Ok(()) => commit_err,
                });
            }
            trailer_result.map_err(CommitError::Log)?;
        }

        // Main flush.
        let filter = if isolated {
            RelationFilter::All
        } else {
            RelationFilter::DataOnly
        };
        let queued = {
            let GraphTx {
                ref graph,
                ref added,
                ref removed,
                ref mut mutator,
                ref config,
                ..
            } = *tx;
            self.prepare_commit(graph, added, removed, filter, mutator, config.acquire_locks)?
        };

        if !queued {
            tx.mutator.commit().map_err(CommitError::Storage)?;
            return Ok(());
        }

        if logging {
            self.append_tx_record(
                tx_id,
                commit_time,
                LogStatus::Precommit,
                Some(&tx.config),
                &tx.mutator,
            )?;
        }

        let mut trigger_success = true;
        let mut index_failures: Vec<(String, IndexError)> = Vec::new();

        let storage_result = tx.mutator.commit_storage();
        let storage_success = storage_result.is_ok();
        let mut commit_error: Option<CommitError> = storage_result.err().map(CommitError::Storage);

        if storage_success {
            index_failures = tx
                .mutator
                .commit_indexes()
                .into_iter()
                .sorted_by(|a, b| a.0.cmp(&b.0))
                .collect();

            if let Some(identifier) = tx.config.log_identifier.clone() {
                if let Err(trigger_err) = self.append_trigger_record(&identifier, tx, commit_time, tx_id) {
                    trigger_success = false;
                    log::error!("trigger log `{identifier}` append failed for tx {tx_id}: {trigger_err:#}");
                }
            }
        }

        // The trailer closes the record regardless of the outcome above.
        if logging {
            let trailer = if commit_error.is_none() && index_failures.is_empty() {
                TxLogTrailer::closing(tx_id, commit_time, LogStatus::Success)
            } else {
                TxLogTrailer::failure(
                    tx_id,
                    commit_time,
                    FailureInfo {
                        storage_success,
                        trigger_success,
                        failed_indexes: index_failures.iter().map(|(name, _)| name.clone()).collect(),
                    },
                )
            };
            if let Err(log_err) = self.append_trailer(&trailer) {
                let prior = commit_error.take().or_else(|| {
                    (!index_failures.is_empty()).then(|| CommitError::Index {
                        failures: std::mem::take(&mut index_failures),
                    })
                });
                return Err(match prior {
                    Some(prior) => CommitError::TrailerAfterFailure {
                        trailer: log_err,
                        source: Box::new(prior),
                    },
                    None => CommitError::Log(log_err),
                });
            }
        }

        if let Some(err) = commit_error {
            return Err(err);
        }
        if !index_failures.is_empty() {
            return Err(CommitError::Index {
                failures: index_failures,
            });
        }
        Ok(())
    }

    // --- phase 4: prepare -------------------------------------------------

    /// Queue, on `mutator`, everything the filtered relations imply: lock
    /// claims, primary mutations grouped per vertex, and index mutations.
    /// Returns whether any primary mutation was queued.
    fn prepare_commit(
        &self,
        graph: &TxGraph,
        added: &[RelationSlot],
        removed: &[RelationSlot],
        filter: RelationFilter,
        mutator: &mut BackendTransaction,
        acquire_locks: bool,
    ) -> Result<bool, CommitError> {
        let codec = &self.inner.edge_codec;
        let ids = &self.inner.id_manager;

        // (relation, position) pairs per vertex id, insertion-ordered.
        let mut mutations: BTreeMap<VertexId, Vec<(RelationSlot, usize)>> = BTreeMap::new();
        let mut mutated_properties: BTreeMap<VertexSlot, Vec<RelationSlot>> = BTreeMap::new();
        let mut index_updates: Vec<IndexUpdate> = Vec::new();

        // Deletions first: their edge locks carry the expected entry, and
        // downstream their index locks precede all addition locks.
        for &slot in removed {
            if !filter.matches(self.is_schema_relation(graph, slot)) {
                continue;
            }
            let relation = graph.relation(slot);
            debug_assert!(relation.lifecycle.is_removed());
            for position in 0..relation.arity() {
                if position == 1 && relation.is_loop() {
                    continue;
                }
                let vertex_slot = relation.vertex(position);
                let vertex = graph.vertex(vertex_slot);
                if !vertex.id.is_assigned() {
                    return Err(InvariantViolation::NonPositiveVertexId(vertex.id).into());
                }
                mutations.entry(vertex.id).or_default().push((slot, position));
                if relation.is_property() {
                    mutated_properties.entry(vertex_slot).or_default().push(slot);
                }
                if relation_needs_lock(relation, position, acquire_locks) {
                    let entry = codec.encode_relation(graph, relation, position)?;
                    mutator.acquire_edge_lock(ids.get_key(vertex.id), entry.column, Some(entry.value));
                }
            }
            index_updates.extend(self.inner.index_codec.updates_for_relation(graph, relation));
        }

        for &slot in added {
            if !filter.matches(self.is_schema_relation(graph, slot)) {
                continue;
            }
            let relation = graph.relation(slot);
            debug_assert!(relation.lifecycle.is_new());
            for position in 0..relation.arity() {
                if position == 1 && relation.is_loop() {
                    continue;
                }
                let vertex_slot = relation.vertex(position);
                let vertex = graph.vertex(vertex_slot);
                if !vertex.id.is_assigned() {
                    return Err(InvariantViolation::NonPositiveVertexId(vertex.id).into());
                }
                mutations.entry(vertex.id).or_default().push((slot, position));
                if relation.is_property() {
                    mutated_properties.entry(vertex_slot).or_default().push(slot);
                }
                // Attaching to a pre-existing vertex can conflict with a
                // concurrent writer of the same column; claim the column
                // only, so distinct columns still append concurrently.
                if relation_needs_lock(relation, position, acquire_locks) && !vertex.is_new() {
                    let entry = codec.encode_relation(graph, relation, position)?;
                    mutator.acquire_edge_lock(ids.get_key(vertex.id), entry.column, None);
                }
            }
            index_updates.extend(self.inner.index_codec.updates_for_relation(graph, relation));
        }

        // Property changes index through their vertex.
        for (vertex_slot, properties) in &mutated_properties {
            index_updates.extend(
                self.inner
                    .index_codec
                    .updates_for_vertex(graph, *vertex_slot, properties),
            );
        }

        // Composite-index locks: all DELETION locks strictly before all
        // ADDITION locks. Mixed indexes never lock.
        if acquire_locks {
            for update in index_updates.iter().filter(|u| u.kind() == IndexMutationKind::Deletion) {
                acquire_index_lock_if_needed(mutator, update);
            }
            for update in index_updates.iter().filter(|u| u.kind() == IndexMutationKind::Addition) {
                acquire_index_lock_if_needed(mutator, update);
            }
        }

        // Primary mutations, grouped per vertex, one entry per enabled view
        // covering the position.
        let mut queued = false;
        for (vertex_id, items) in &mutations {
            let key = ids.get_key(*vertex_id);
            let mut additions = Vec::new();
            let mut deletions = Vec::new();
            for &(slot, position) in items {
                let relation = graph.relation(slot);
                for view in relation.ty.views() {
                    if view.status == SchemaStatus::Disabled {
                        continue;
                    }
                    if !view.directionality.covers_position(position) {
                        continue;
                    }
                    let entry = codec.encode_relation_as(graph, relation, &view, position)?;
                    if relation.lifecycle.is_removed() {
                        deletions.push(entry.column);
                    } else {
                        additions.push(entry);
                    }
                }
            }
            if !additions.is_empty() || !deletions.is_empty() {
                mutator.mutate_edges(key, additions, deletions);
                queued = true;
            }
        }

        // Index mutations: composite to the index store, mixed to their
        // backend sub-transactions with create/remove hints.
        for update in index_updates {
            match update {
                IndexUpdate::Composite { kind, key, entry, .. } => match kind {
                    IndexMutationKind::Addition => mutator.mutate_index(key, vec![entry], Vec::new()),
                    IndexMutationKind::Deletion => mutator.mutate_index(key, Vec::new(), vec![entry.column]),
                },
                IndexUpdate::Mixed {
                    index,
                    kind,
                    doc_id,
                    field,
                    value,
                    element,
                    ..
                } => {
                    let backend = index
                        .mixed_backend()
                        .expect("mixed update always carries a mixed backing")
                        .to_owned();
                    let store = index.element.store_name();
                    let sub_tx = mutator.index_transaction(&backend).map_err(|e| CommitError::Index {
                        failures: vec![(backend.clone(), e)],
                    })?;
                    match kind {
                        IndexMutationKind::Addition => sub_tx.add(store, doc_id, field, value, element.is_new),
                        IndexMutationKind::Deletion => {
                            sub_tx.delete(store, doc_id, field, value, element.is_removed)
                        }
                    }
                }
            }
        }

        Ok(queued)
    }

    // --- transaction-log plumbing -----------------------------------------

    /// Append a header+payload record for this transaction and phase.
    fn append_tx_record(
        &self,
        tx_id: u64,
        commit_time: i64,
        status: LogStatus,
        config: Option<&TxConfig>,
        mutator: &BackendTransaction,
    ) -> Result<(), LogError> {
        let header = TxLogHeader {
            tx_id,
            commit_time,
            status,
            config: config.map(|c| ConfigBlock {
                acquire_locks: c.acquire_locks,
                batch_loading: c.batch_loading,
                log_identifier: c.log_identifier.clone(),
            }),
        };
        let mut record = Vec::with_capacity(header.encoded_len() + 128);
        header.encode(&mut record);
        mutator.log_mutations(&mut record);
        let log = self.inner.backend.log(TX_LOG_NAME)?;
        log.append(header.log_key().into(), record.into())
    }

    fn append_trailer(&self, trailer: &TxLogTrailer) -> Result<(), LogError> {
        let mut record = Vec::with_capacity(trailer.encoded_len());
        trailer.encode(&mut record);
        let log = self.inner.backend.log(TX_LOG_NAME)?;
        log.append(trailer.header.log_key().into(), record.into())
    }

    /// Append one audit record to the transaction's trigger log.
    fn append_trigger_record(
        &self,
        identifier: &str,
        tx: &GraphTx,
        commit_time: i64,
        tx_id: u64,
    ) -> anyhow::Result<()> {
        let mut record = TriggerRecord {
            commit_time,
            tx_id,
            added: Vec::with_capacity(tx.added.len()),
            removed: Vec::with_capacity(tx.removed.len()),
        };
        for (slots, out) in [(&tx.added, &mut record.added), (&tx.removed, &mut record.removed)] {
            for &slot in slots.iter() {
                let relation = tx.graph.relation(slot);
                let (vertex, entry) = primary_entry(&self.inner.edge_codec, &tx.graph, relation)?;
                out.push(TriggerEntry {
                    vertex_id: vertex.0,
                    column: entry.column,
                    value: entry.value,
                });
            }
        }
        let mut buf = Vec::with_capacity(record.encoded_len());
        record.encode(&mut buf);
        let mut key = Vec::new();
        encode_varint(tx_id, &mut key);
        let log = self.inner.backend.log(identifier)?;
        log.append(key.into(), buf.into())?;
        Ok(())
    }
}

/// The edge-lock predicate: LOCK-consistency types whose multiplicity makes
/// the write a potential lost update at this position.
fn relation_needs_lock(relation: &Relation, position: usize, acquire_locks: bool) -> bool {
    if !acquire_locks || relation.ty.consistency != ConsistencyModifier::Lock {
        return false;
    }
    let direction = Direction::from_position(position);
    relation.ty.multiplicity.is_unique(direction)
        || (position == 0 && relation.ty.multiplicity == Multiplicity::Simple)
}

/// The composite-index lock predicate: LOCK-consistency indexes over
/// non-LIST keys. Deletion locks assert the expected entry; addition locks
/// reserve the column only.
fn acquire_index_lock_if_needed(mutator: &mut BackendTransaction, update: &IndexUpdate) {
    if let IndexUpdate::Composite {
        index,
        kind,
        key,
        entry,
        key_cardinality,
        ..
    } = update
    {
        if index.consistency != ConsistencyModifier::Lock || *key_cardinality == Cardinality::List {
            return;
        }
        match kind {
            IndexMutationKind::Deletion => mutator.acquire_index_lock(
                key.clone(),
                entry.column.clone(),
                Some(entry.value.clone()),
            ),
            IndexMutationKind::Addition => {
                mutator.acquire_index_lock(key.clone(), entry.column.clone(), None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_partition_is_exact() {
        for is_schema in [false, true] {
            assert!(RelationFilter::All.matches(is_schema));
            assert_eq!(RelationFilter::SchemaOnly.matches(is_schema), is_schema);
            assert_eq!(RelationFilter::DataOnly.matches(is_schema), !is_schema);
        }
    }
}
