//! Permanent id assignment and the id ↔ storage-key transform.
//!
//! Vertex ids and relation ids come from disjoint spaces; schema vertices
//! additionally carry a reserved high bit so they can be recognized from the
//! id alone. Storage keys are the big-endian bytes of the bit-reversed id:
//! reversal spreads sequentially-assigned ids across the key space (which
//! keeps ordered backends from hot-spotting one region) and is trivially
//! undone on read.

use parking_lot::Mutex;
use quiver_codec::DecodeError;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::InvariantViolation;

use super::relation::{RelationSlot, TxGraph, VertexSlot};
use super::{RelationId, StaticBuffer, VertexId};

/// High bit marking ids from the schema space.
const SCHEMA_ID_BIT: u64 = 1 << 60;

/// Exclusive upper bound of assignable ids; keeps every id positive as i64.
const MAX_ID: u64 = 1 << 61;

/// Classification queries over assigned ids.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdInspector;

impl IdInspector {
    pub fn is_schema_id(&self, id: VertexId) -> bool {
        id.0 & SCHEMA_ID_BIT != 0
    }

    pub fn is_user_vertex_id(&self, id: VertexId) -> bool {
        id.is_assigned() && !self.is_schema_id(id)
    }

    pub fn is_valid_vertex_id(&self, id: VertexId) -> bool {
        id.is_assigned() && id.0 < MAX_ID
    }
}

/// Maps vertex ids to storage keys and back.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdManager {
    inspector: IdInspector,
}

impl IdManager {
    pub const KEY_LEN: usize = 8;

    /// Smallest possible storage key.
    pub fn min_key(&self) -> StaticBuffer {
        StaticBuffer::copy_from_slice(&[0u8; Self::KEY_LEN])
    }

    /// Largest possible storage key.
    pub fn max_key(&self) -> StaticBuffer {
        StaticBuffer::copy_from_slice(&[0xffu8; Self::KEY_LEN])
    }

    pub fn get_key(&self, id: VertexId) -> StaticBuffer {
        StaticBuffer::copy_from_slice(&id.0.reverse_bits().to_be_bytes())
    }

    pub fn get_key_id(&self, key: &[u8]) -> Result<VertexId, DecodeError> {
        if key.len() != Self::KEY_LEN {
            return Err(DecodeError::BufferLength {
                needed: Self::KEY_LEN,
                remaining: key.len(),
            });
        }
        let mut raw = [0u8; Self::KEY_LEN];
        raw.copy_from_slice(key);
        Ok(VertexId(u64::from_be_bytes(raw).reverse_bits()))
    }

    pub fn inspector(&self) -> IdInspector {
        self.inspector
    }
}

/// One id space: ids handed out up to a reserved watermark, with the
/// watermark advanced block-wise. The cross-process reservation policy lives
/// behind this seam and is not part of the engine.
#[derive(Debug)]
struct IdCounter {
    next: u64,
    reserved: u64,
    block_size: u64,
}

impl IdCounter {
    fn new(start: u64, block_size: u64) -> Self {
        Self {
            next: start,
            reserved: start,
            block_size,
        }
    }

    fn next_id(&mut self) -> u64 {
        if self.next >= self.reserved {
            self.reserved += self.block_size;
        }
        let id = self.next;
        self.next += 1;
        id
    }
}

/// Hands out permanent ids for vertices and relations.
pub struct IdAssigner {
    vertex_ids: Mutex<IdCounter>,
    schema_ids: Mutex<IdCounter>,
    relation_ids: Mutex<IdCounter>,
    closed: AtomicBool,
}

impl IdAssigner {
    pub fn new(block_size: u64) -> Self {
        let block_size = block_size.max(1);
        Self {
            // Skip the reserved system range in both vertex spaces.
            vertex_ids: Mutex::new(IdCounter::new(1 << 10, block_size)),
            schema_ids: Mutex::new(IdCounter::new(SCHEMA_ID_BIT | (1 << 10), block_size)),
            relation_ids: Mutex::new(IdCounter::new(1, block_size)),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<(), InvariantViolation> {
        if self.closed.load(Ordering::Acquire) {
            return Err(InvariantViolation::IdAssignerClosed);
        }
        Ok(())
    }

    /// Assign a permanent id to the vertex in `slot` if it has none.
    pub fn assign_vertex_id(&self, graph: &mut TxGraph, slot: VertexSlot) -> Result<VertexId, InvariantViolation> {
        self.ensure_open()?;
        let schema = graph.vertex(slot).schema;
        let vertex = graph.vertex_mut(slot);
        if vertex.id.is_assigned() {
            return Ok(vertex.id);
        }
        let id = if schema {
            VertexId(self.schema_ids.lock().next_id())
        } else {
            VertexId(self.vertex_ids.lock().next_id())
        };
        vertex.id = id;
        Ok(id)
    }

    /// Assign a permanent id to one relation, and to any of its NEW
    /// vertices still lacking one.
    pub fn assign_relation_id(&self, graph: &mut TxGraph, slot: RelationSlot) -> Result<RelationId, InvariantViolation> {
        self.ensure_open()?;
        for position in 0..graph.relation(slot).arity() {
            let vslot = graph.relation(slot).vertex(position);
            let vertex = graph.vertex(vslot);
            if !vertex.id.is_assigned() {
                if !vertex.is_new() {
                    // Only freshly-created vertices may lack an id.
                    return Err(InvariantViolation::NonPositiveVertexId(vertex.id));
                }
                self.assign_vertex_id(graph, vslot)?;
            }
        }
        let relation = graph.relation_mut(slot);
        if !relation.id.is_assigned() {
            relation.id = RelationId(self.relation_ids.lock().next_id());
        }
        Ok(relation.id)
    }

    /// Batched assignment for all NEW relations of a commit.
    pub fn assign_ids(&self, graph: &mut TxGraph, relations: &[RelationSlot]) -> Result<(), InvariantViolation> {
        for &slot in relations {
            self.assign_relation_id(graph, slot)?;
        }
        Ok(())
    }

    /// Stop handing out ids. Idempotent.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::relation::Lifecycle;
    use crate::db::schema::RelationTypeSchema;
    use crate::db::TypeId;
    use proptest::prelude::*;
    use std::sync::Arc;

    proptest! {
        #[test]
        fn key_transform_roundtrips(raw in 1u64..MAX_ID) {
            let ids = IdManager::default();
            let id = VertexId(raw);
            prop_assert_eq!(ids.get_key_id(&ids.get_key(id)).unwrap(), id);
        }
    }

    #[test]
    fn sequential_ids_spread_across_the_key_space() {
        let ids = IdManager::default();
        // Adjacent ids must not share a key prefix byte.
        let k1 = ids.get_key(VertexId(1));
        let k2 = ids.get_key(VertexId(2));
        assert_ne!(k1[0], k2[0]);
    }

    #[test]
    fn malformed_key_is_rejected() {
        let ids = IdManager::default();
        assert!(ids.get_key_id(&[1, 2, 3]).is_err());
    }

    #[test]
    fn schema_ids_are_recognizable() {
        let assigner = IdAssigner::new(64);
        let mut graph = TxGraph::new();
        let user = graph.new_vertex(None, Lifecycle::New);
        let schema = graph.new_schema_vertex(None, Lifecycle::New);
        let user_id = assigner.assign_vertex_id(&mut graph, user).unwrap();
        let schema_id = assigner.assign_vertex_id(&mut graph, schema).unwrap();

        let inspector = IdManager::default().inspector();
        assert!(inspector.is_user_vertex_id(user_id));
        assert!(inspector.is_schema_id(schema_id));
        assert!(inspector.is_valid_vertex_id(schema_id));
    }

    #[test]
    fn assignment_is_idempotent_and_batched() {
        let assigner = IdAssigner::new(64);
        let mut graph = TxGraph::new();
        let ty = Arc::new(RelationTypeSchema::property(TypeId(1000), "name"));
        let v = graph.new_vertex(None, Lifecycle::New);
        let p1 = graph.new_property(ty.clone(), v, "a".into(), Lifecycle::New);
        let p2 = graph.new_property(ty, v, "b".into(), Lifecycle::New);

        assigner.assign_ids(&mut graph, &[p1, p2]).unwrap();
        let vid = graph.vertex(v).id;
        assert!(vid.is_assigned());
        assert_ne!(graph.relation(p1).id, graph.relation(p2).id);

        // Re-running must not reassign.
        let r1 = graph.relation(p1).id;
        assigner.assign_ids(&mut graph, &[p1]).unwrap();
        assert_eq!(graph.relation(p1).id, r1);
        assert_eq!(graph.vertex(v).id, vid);
    }

    #[test]
    fn closed_assigner_refuses() {
        let assigner = IdAssigner::new(64);
        assigner.close();
        let mut graph = TxGraph::new();
        let v = graph.new_vertex(None, Lifecycle::New);
        assert_eq!(
            assigner.assign_vertex_id(&mut graph, v),
            Err(InvariantViolation::IdAssignerClosed)
        );
    }
}
