//! Derivation of secondary-index mutations from graph mutations.
//!
//! Composite indexes bucket elements under a deterministic hash of the
//! indexed value; the bucket lives in the engine's own index store, so the
//! entries here have the physical key-column-value shape. Mixed indexes are
//! documents in an external backend, addressed by an id derived from the
//! owning element's id.

use smallvec::SmallVec;

use super::id::IdInspector;
use super::relation::{PropertyValue, Relation, RelationKind, RelationSlot, TxGraph, VertexSlot};
use super::schema::{
    ElementState, GraphIndex, IndexMutationKind, IndexUpdate, SchemaStatus,
};
use super::{Entry, StaticBuffer};
use quiver_codec::encode_varint;

/// Length of the value-hash suffix of a composite bucket key.
const BUCKET_HASH_LEN: usize = 16;

#[derive(Debug, Clone, Copy, Default)]
pub struct IndexCodec {
    inspector: IdInspector,
}

impl IndexCodec {
    /// The bucket key of `value` within `index`: the index id, then a
    /// truncated blake3 hash of the value's canonical encoding.
    pub fn composite_key(&self, index: &GraphIndex, value: &PropertyValue) -> StaticBuffer {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&index.id.to_be_bytes());
        hasher.update(&value.encoded());
        let digest = hasher.finalize();

        let mut key = Vec::with_capacity(8 + BUCKET_HASH_LEN);
        key.extend_from_slice(&index.id.to_be_bytes());
        key.extend_from_slice(&digest.as_bytes()[..BUCKET_HASH_LEN]);
        key.into()
    }

    /// The mixed-index document id of an element.
    pub fn document_id(&self, element_id: u64) -> String {
        hex::encode(element_id.to_be_bytes())
    }

    fn bucket_entry(&self, element_id: u64) -> Entry {
        let mut column = Vec::new();
        encode_varint(element_id, &mut column);
        Entry::new(column.into(), StaticBuffer::new())
    }

    /// Index updates owned by the relation itself. Properties contribute
    /// nothing here; they are indexed through their vertex (see
    /// [`Self::updates_for_vertex`]).
    pub fn updates_for_relation(&self, graph: &TxGraph, relation: &Relation) -> SmallVec<[IndexUpdate; 2]> {
        let mut updates = SmallVec::new();
        let payload = match &relation.kind {
            RelationKind::Property { .. } => return updates,
            RelationKind::Edge { payload, .. } => payload.clone(),
        };
        let kind = mutation_kind(relation);
        let element = ElementState::of(relation.lifecycle);
        let value = PropertyValue::Bytes(payload);
        let owner = graph.vertex(relation.vertex(0));
        let schema_update = relation.ty.base && self.inspector.is_schema_id(owner.id);

        for index in &relation.ty.graph_indexes {
            if index.status == SchemaStatus::Disabled {
                continue;
            }
            updates.push(self.update_for(
                index.clone(),
                kind,
                relation.id.0,
                &relation.ty.name,
                &value,
                relation.ty.ttl_seconds,
                relation.ty.cardinality,
                element,
                schema_update,
            ));
        }
        updates
    }

    /// Index updates for a vertex whose properties changed this transaction.
    pub fn updates_for_vertex(
        &self,
        graph: &TxGraph,
        vertex: VertexSlot,
        properties: &[RelationSlot],
    ) -> Vec<IndexUpdate> {
        let owner = graph.vertex(vertex);
        let element = ElementState::of(owner.lifecycle);
        let mut updates = Vec::new();

        for &slot in properties {
            let property = graph.relation(slot);
            let value = match property.property_value() {
                Some(value) => value,
                None => continue,
            };
            let kind = mutation_kind(property);
            let schema_update = property.ty.base && self.inspector.is_schema_id(owner.id);

            for index in &property.ty.graph_indexes {
                if index.status == SchemaStatus::Disabled {
                    continue;
                }
                updates.push(self.update_for(
                    index.clone(),
                    kind,
                    owner.id.0,
                    &property.ty.name,
                    value,
                    property.ty.ttl_seconds,
                    property.ty.cardinality,
                    element,
                    schema_update,
                ));
            }
        }
        updates
    }

    #[allow(clippy::too_many_arguments)]
    fn update_for(
        &self,
        index: std::sync::Arc<GraphIndex>,
        kind: IndexMutationKind,
        element_id: u64,
        field: &str,
        value: &PropertyValue,
        ttl_seconds: u32,
        key_cardinality: super::schema::Cardinality,
        element: ElementState,
        schema_update: bool,
    ) -> IndexUpdate {
        if index.is_composite() {
            let key = self.composite_key(&index, value);
            let mut entry = self.bucket_entry(element_id);
            if kind == IndexMutationKind::Addition && ttl_seconds > 0 {
                entry = entry.with_ttl(ttl_seconds);
            }
            IndexUpdate::Composite {
                index,
                kind,
                key,
                entry,
                element,
                key_cardinality,
                schema_update,
            }
        } else {
            IndexUpdate::Mixed {
                doc_id: self.document_id(element_id),
                index,
                kind,
                field: field.to_owned(),
                value: value.clone(),
                element,
                schema_update,
            }
        }
    }
}

fn mutation_kind(relation: &Relation) -> IndexMutationKind {
    if relation.lifecycle.is_removed() {
        IndexMutationKind::Deletion
    } else {
        IndexMutationKind::Addition
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::relation::Lifecycle;
    use crate::db::schema::{
        Cardinality, ConsistencyModifier, ElementCategory, IndexBacking, RelationTypeSchema,
    };
    use crate::db::{RelationId, TypeId, VertexId};
    use std::sync::Arc;

    fn composite_index(id: u64, status: SchemaStatus) -> Arc<GraphIndex> {
        Arc::new(GraphIndex {
            id,
            name: format!("idx_{id}"),
            backing: IndexBacking::Composite,
            element: ElementCategory::Vertex,
            consistency: ConsistencyModifier::Lock,
            status,
        })
    }

    fn mixed_index(id: u64) -> Arc<GraphIndex> {
        Arc::new(GraphIndex {
            id,
            name: format!("idx_{id}"),
            backing: IndexBacking::Mixed {
                backend: "search".into(),
            },
            element: ElementCategory::Vertex,
            consistency: ConsistencyModifier::Default,
            status: SchemaStatus::Enabled,
        })
    }

    fn indexed_property(
        graph: &mut TxGraph,
        indexes: Vec<Arc<GraphIndex>>,
        lifecycle: Lifecycle,
        ttl_seconds: u32,
    ) -> (VertexSlot, RelationSlot) {
        let mut ty = RelationTypeSchema::property(TypeId(1200), "name");
        ty.graph_indexes = indexes;
        ty.cardinality = Cardinality::Set;
        ty.ttl_seconds = ttl_seconds;
        let v = graph.new_vertex(None, Lifecycle::New);
        graph.vertex_mut(v).id = VertexId(42);
        let p = graph.new_property(Arc::new(ty), v, "a".into(), lifecycle);
        graph.relation_mut(p).id = RelationId(7);
        (v, p)
    }

    #[test]
    fn composite_keys_are_deterministic_and_value_addressed() {
        let codec = IndexCodec::default();
        let index = composite_index(1, SchemaStatus::Enabled);
        let k1 = codec.composite_key(&index, &"a".into());
        let k2 = codec.composite_key(&index, &"a".into());
        let k3 = codec.composite_key(&index, &"b".into());
        assert_eq!(k1, k2);
        assert_ne!(k1, k3);
        // Same value, different index: different bucket.
        let other = composite_index(2, SchemaStatus::Enabled);
        assert_ne!(k1, codec.composite_key(&other, &"a".into()));
    }

    #[test]
    fn removal_of_one_value_is_one_deletion() {
        let codec = IndexCodec::default();
        let mut graph = TxGraph::new();
        let (v, p) = indexed_property(
            &mut graph,
            vec![composite_index(1, SchemaStatus::Enabled)],
            Lifecycle::Removed,
            0,
        );
        let updates = codec.updates_for_vertex(&graph, v, &[p]);
        assert_eq!(updates.len(), 1);
        match &updates[0] {
            IndexUpdate::Composite { kind, entry, .. } => {
                assert_eq!(*kind, IndexMutationKind::Deletion);
                assert_eq!(entry.ttl_seconds, None);
            }
            other => panic!("expected composite update, got {other:?}"),
        }
    }

    #[test]
    fn disabled_indexes_contribute_nothing() {
        let codec = IndexCodec::default();
        let mut graph = TxGraph::new();
        let (v, p) = indexed_property(
            &mut graph,
            vec![composite_index(1, SchemaStatus::Disabled)],
            Lifecycle::New,
            0,
        );
        assert!(codec.updates_for_vertex(&graph, v, &[p]).is_empty());
    }

    #[test]
    fn ttl_rides_only_on_additions() {
        let codec = IndexCodec::default();
        let mut graph = TxGraph::new();
        let (v, p) = indexed_property(
            &mut graph,
            vec![composite_index(1, SchemaStatus::Enabled)],
            Lifecycle::New,
            90,
        );
        let updates = codec.updates_for_vertex(&graph, v, &[p]);
        match &updates[0] {
            IndexUpdate::Composite { entry, .. } => assert_eq!(entry.ttl_seconds, Some(90)),
            other => panic!("expected composite update, got {other:?}"),
        }
    }

    #[test]
    fn mixed_updates_carry_doc_id_and_hints() {
        let codec = IndexCodec::default();
        let mut graph = TxGraph::new();
        let (v, p) = indexed_property(&mut graph, vec![mixed_index(3)], Lifecycle::New, 0);
        let updates = codec.updates_for_vertex(&graph, v, &[p]);
        match &updates[0] {
            IndexUpdate::Mixed {
                doc_id,
                field,
                element,
                ..
            } => {
                assert_eq!(doc_id, &codec.document_id(42));
                assert_eq!(field, "name");
                assert!(element.is_new);
                assert!(!element.is_removed);
            }
            other => panic!("expected mixed update, got {other:?}"),
        }
    }

    #[test]
    fn properties_do_not_self_index() {
        let codec = IndexCodec::default();
        let mut graph = TxGraph::new();
        let (_, p) = indexed_property(
            &mut graph,
            vec![composite_index(1, SchemaStatus::Enabled)],
            Lifecycle::New,
            0,
        );
        assert!(codec
            .updates_for_relation(&graph, &graph.relation(p).clone())
            .is_empty());
    }
}
