//! In-memory representation of the mutations a transaction accumulates.
//!
//! Vertices and relations live in a per-transaction arena ([`TxGraph`]) and
//! refer to each other by slot index. Dropping the arena releases the whole
//! transaction at once; there are no cyclic ownership edges to unpick.

use bytes::Bytes;
use quiver_codec::{encode_varint, BufWriter};
use smallvec::SmallVec;
use std::sync::Arc;

use super::schema::RelationTypeSchema;
use super::{RelationId, VertexId};

/// Where an element is in its life within the owning transaction. Commit
/// processes only `New` and `Removed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    New,
    Loaded,
    Modified,
    Removed,
}

impl Lifecycle {
    pub fn is_new(self) -> bool {
        matches!(self, Lifecycle::New)
    }

    pub fn is_removed(self) -> bool {
        matches!(self, Lifecycle::Removed)
    }
}

/// A value attached to a property relation, or indexed out of one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PropertyValue {
    Bool(bool),
    Long(i64),
    Text(String),
    Bytes(Bytes),
}

impl PropertyValue {
    /// Canonical byte encoding: a tag byte followed by the payload. Used in
    /// physical columns/values, so it must stay stable.
    pub fn encode(&self, out: &mut impl BufWriter) {
        match self {
            PropertyValue::Bool(b) => {
                out.put_u8(0);
                out.put_u8(*b as u8);
            }
            PropertyValue::Long(v) => {
                out.put_u8(1);
                out.put_i64(*v);
            }
            PropertyValue::Text(s) => {
                out.put_u8(2);
                encode_varint(s.len() as u64, out);
                out.put_slice(s.as_bytes());
            }
            PropertyValue::Bytes(b) => {
                out.put_u8(3);
                encode_varint(b.len() as u64, out);
                out.put_slice(b);
            }
        }
    }

    pub fn encoded(&self) -> Bytes {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf.into()
    }
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        PropertyValue::Text(s.to_owned())
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        PropertyValue::Long(v)
    }
}

/// Arena index of a vertex within its transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VertexSlot(pub(crate) usize);

/// Arena index of a relation within its transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RelationSlot(pub(crate) usize);

#[derive(Debug, Clone)]
pub struct Vertex {
    pub id: VertexId,
    pub label: Option<String>,
    pub lifecycle: Lifecycle,
    /// Allocate the id from the schema space rather than the user space.
    pub schema: bool,
}

impl Vertex {
    pub fn is_new(&self) -> bool {
        self.lifecycle.is_new()
    }
}

/// The payload distinguishing an edge from a vertex property.
#[derive(Debug, Clone)]
pub enum RelationKind {
    /// A vertex property: one participating vertex and a value.
    Property { vertex: VertexSlot, value: PropertyValue },
    /// An edge from `out` to `in_` carrying an opaque payload.
    Edge {
        out: VertexSlot,
        in_: VertexSlot,
        payload: Bytes,
    },
}

#[derive(Debug, Clone)]
pub struct Relation {
    pub id: RelationId,
    pub ty: Arc<RelationTypeSchema>,
    pub lifecycle: Lifecycle,
    pub kind: RelationKind,
}

impl Relation {
    /// Number of participating vertices: 1 for a property, 2 for an edge.
    pub fn arity(&self) -> usize {
        match self.kind {
            RelationKind::Property { .. } => 1,
            RelationKind::Edge { .. } => 2,
        }
    }

    /// The vertex at `position`; position 0 is the property owner or the
    /// out-vertex, position 1 the in-vertex.
    pub fn vertex(&self, position: usize) -> VertexSlot {
        match (&self.kind, position) {
            (RelationKind::Property { vertex, .. }, 0) => *vertex,
            (RelationKind::Edge { out, .. }, 0) => *out,
            (RelationKind::Edge { in_, .. }, 1) => *in_,
            _ => panic!("relation position {position} out of range for arity {}", self.arity()),
        }
    }

    /// True for an edge whose endpoints coincide.
    pub fn is_loop(&self) -> bool {
        matches!(&self.kind, RelationKind::Edge { out, in_, .. } if out == in_)
    }

    pub fn is_property(&self) -> bool {
        matches!(self.kind, RelationKind::Property { .. })
    }

    pub fn property_value(&self) -> Option<&PropertyValue> {
        match &self.kind {
            RelationKind::Property { value, .. } => Some(value),
            RelationKind::Edge { .. } => None,
        }
    }
}

/// Per-transaction arena of vertices and relations.
#[derive(Debug, Default)]
pub struct TxGraph {
    vertices: Vec<Vertex>,
    relations: Vec<Relation>,
    /// Incident relation slots per vertex, in creation order.
    incident: Vec<SmallVec<[RelationSlot; 4]>>,
}

impl TxGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_vertex(&mut self, label: Option<String>, lifecycle: Lifecycle) -> VertexSlot {
        self.push_vertex(Vertex {
            id: VertexId::UNASSIGNED,
            label,
            lifecycle,
            schema: false,
        })
    }

    /// A vertex representing a schema entry; its id is allocated from the
    /// schema id space.
    pub fn new_schema_vertex(&mut self, label: Option<String>, lifecycle: Lifecycle) -> VertexSlot {
        self.push_vertex(Vertex {
            id: VertexId::UNASSIGNED,
            label,
            lifecycle,
            schema: true,
        })
    }

    /// A vertex loaded from storage with a known id.
    pub fn existing_vertex(&mut self, id: VertexId) -> VertexSlot {
        self.push_vertex(Vertex {
            id,
            label: None,
            lifecycle: Lifecycle::Loaded,
            schema: false,
        })
    }

    fn push_vertex(&mut self, vertex: Vertex) -> VertexSlot {
        self.vertices.push(vertex);
        self.incident.push(SmallVec::new());
        VertexSlot(self.vertices.len() - 1)
    }

    pub fn new_property(
        &mut self,
        ty: Arc<RelationTypeSchema>,
        vertex: VertexSlot,
        value: PropertyValue,
        lifecycle: Lifecycle,
    ) -> RelationSlot {
        self.push_relation(Relation {
            id: RelationId::UNASSIGNED,
            ty,
            lifecycle,
            kind: RelationKind::Property { vertex, value },
        })
    }

    pub fn new_edge(
        &mut self,
        ty: Arc<RelationTypeSchema>,
        out: VertexSlot,
        in_: VertexSlot,
        payload: Bytes,
        lifecycle: Lifecycle,
    ) -> RelationSlot {
        self.push_relation(Relation {
            id: RelationId::UNASSIGNED,
            ty,
            lifecycle,
            kind: RelationKind::Edge { out, in_, payload },
        })
    }

    fn push_relation(&mut self, relation: Relation) -> RelationSlot {
        let slot = RelationSlot(self.relations.len());
        for position in 0..relation.arity() {
            if position == 1 && relation.is_loop() {
                break;
            }
            self.incident[relation.vertex(position).0].push(slot);
        }
        self.relations.push(relation);
        slot
    }

    pub fn vertex(&self, slot: VertexSlot) -> &Vertex {
        &self.vertices[slot.0]
    }

    pub fn vertex_mut(&mut self, slot: VertexSlot) -> &mut Vertex {
        &mut self.vertices[slot.0]
    }

    pub fn relation(&self, slot: RelationSlot) -> &Relation {
        &self.relations[slot.0]
    }

    pub fn relation_mut(&mut self, slot: RelationSlot) -> &mut Relation {
        &mut self.relations[slot.0]
    }

    /// The incident relation mutations of a vertex, in creation order.
    pub fn incident_relations(&self, slot: VertexSlot) -> impl Iterator<Item = RelationSlot> + '_ {
        self.incident[slot.0].iter().copied()
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn relation_count(&self) -> usize {
        self.relations.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::RelationTypeSchema;
    use crate::db::TypeId;

    fn some_type() -> Arc<RelationTypeSchema> {
        Arc::new(RelationTypeSchema::property(TypeId(1000), "name"))
    }

    #[test]
    fn positions_and_arity() {
        let mut graph = TxGraph::new();
        let u = graph.new_vertex(None, Lifecycle::New);
        let v = graph.new_vertex(None, Lifecycle::New);
        let edge = graph.new_edge(some_type(), u, v, Bytes::new(), Lifecycle::New);

        let rel = graph.relation(edge);
        assert_eq!(rel.arity(), 2);
        assert_eq!(rel.vertex(0), u);
        assert_eq!(rel.vertex(1), v);
        assert!(!rel.is_loop());
    }

    #[test]
    fn loops_are_recorded_once_in_adjacency() {
        let mut graph = TxGraph::new();
        let v = graph.new_vertex(None, Lifecycle::New);
        let edge = graph.new_edge(some_type(), v, v, Bytes::new(), Lifecycle::New);

        assert!(graph.relation(edge).is_loop());
        assert_eq!(graph.incident_relations(v).count(), 1);
    }

    #[test]
    fn property_value_encoding_is_tagged() {
        let mut buf = Vec::new();
        PropertyValue::from("a").encode(&mut buf);
        assert_eq!(buf, vec![2, 1, b'a']);

        let mut buf = Vec::new();
        PropertyValue::Long(-1).encode(&mut buf);
        assert_eq!(buf.len(), 9);
    }
}
