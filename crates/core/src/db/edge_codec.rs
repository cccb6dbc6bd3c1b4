//! Physical encoding of relations into adjacency entries.
//!
//! Every entry of a vertex's adjacency starts with an 8-byte big-endian tag
//! `type_id << 2 | dir` (dir: 0 property, 1 edge-out, 2 edge-in). Big-endian
//! fixed-width tags order the same numerically and lexicographically, so a
//! `(type, direction)` slice is one contiguous column range, and a
//! BOTH-direction query covers the adjacent out/in tags with a single range.
//!
//! What follows the tag depends on the type's multiplicity/cardinality: the
//! column carries exactly the fields that make the entry unique under the
//! type's constraints, so that writing a constrained relation overwrites its
//! predecessor instead of accumulating siblings.

use quiver_codec::{decode_varint, encode_varint, DecodeError};

use crate::error::InvariantViolation;

use super::backend::SliceQuery;
use super::relation::{Relation, RelationKind, TxGraph};
use super::schema::{
    system, Cardinality, Direction, Directionality, RelationIndexView, RelationTypeSchema, TypeKind,
};
use super::{Entry, StaticBuffer, TypeId, VertexId};

/// Direction discriminator within a column tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DirCode {
    Property = 0,
    EdgeOut = 1,
    EdgeIn = 2,
}

impl DirCode {
    fn from_bits(bits: u64) -> Result<Self, DecodeError> {
        Ok(match bits {
            0 => DirCode::Property,
            1 => DirCode::EdgeOut,
            2 => DirCode::EdgeIn,
            other => {
                return Err(DecodeError::InvalidTag {
                    tag: other as u8,
                    kind: "column direction",
                })
            }
        })
    }
}

/// Decoded column head: enough to attribute an entry without its schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub type_id: TypeId,
    pub dir: DirCode,
}

const TAG_LEN: usize = 8;

fn tag_bytes(type_id: TypeId, dir: u64) -> [u8; TAG_LEN] {
    ((type_id.0 << 2) | dir).to_be_bytes()
}

/// Stateless encoder/decoder for adjacency entries and slice queries.
#[derive(Debug, Clone, Copy, Default)]
pub struct EdgeCodec;

impl EdgeCodec {
    /// Encode `relation` as the entry written under the vertex at
    /// `position`, using the relation's canonical view.
    pub fn encode_relation(
        &self,
        graph: &TxGraph,
        relation: &Relation,
        position: usize,
    ) -> Result<Entry, InvariantViolation> {
        let view = RelationIndexView {
            as_type: relation.ty.id,
            directionality: relation.ty.directionality,
            status: relation.ty.status,
            sort_by_value: false,
        };
        self.encode_relation_as(graph, relation, &view, position)
    }

    /// Encode `relation` under an alternate relation-index view.
    pub fn encode_relation_as(
        &self,
        graph: &TxGraph,
        relation: &Relation,
        view: &RelationIndexView,
        position: usize,
    ) -> Result<Entry, InvariantViolation> {
        if !relation.id.is_assigned() {
            return Err(InvariantViolation::RelationIdUnassigned);
        }
        let relation_id = relation.id.0;
        let ty = &relation.ty;

        let mut column = Vec::with_capacity(TAG_LEN + 16);
        let mut value = Vec::new();

        match &relation.kind {
            RelationKind::Property { value: prop, .. } => {
                column.extend_from_slice(&tag_bytes(view.as_type, DirCode::Property as u64));
                if view.sort_by_value {
                    prop.encode(&mut column);
                }
                match ty.cardinality {
                    // Constrained to one value: the bare tag is the column,
                    // so a rewrite replaces it.
                    Cardinality::Single => {
                        encode_varint(relation_id, &mut value);
                        prop.encode(&mut value);
                    }
                    // One entry per distinct value.
                    Cardinality::Set => {
                        prop.encode(&mut column);
                        encode_varint(relation_id, &mut value);
                    }
                    // One entry per property instance.
                    Cardinality::List => {
                        encode_varint(relation_id, &mut column);
                        prop.encode(&mut value);
                    }
                }
            }
            RelationKind::Edge { payload, .. } => {
                let dir = if position == 0 { DirCode::EdgeOut } else { DirCode::EdgeIn };
                column.extend_from_slice(&tag_bytes(view.as_type, dir as u64));
                if view.sort_by_value {
                    column.extend_from_slice(payload);
                }
                let other = graph.vertex(relation.vertex(1 - position)).id;
                if !other.is_assigned() {
                    return Err(InvariantViolation::NonPositiveVertexId(other));
                }
                let direction = Direction::from_position(position);
                if ty.multiplicity.is_unique(direction) {
                    // At most one such edge per vertex in this direction:
                    // bare tag, everything else in the value.
                    encode_varint(other.0, &mut value);
                    encode_varint(relation_id, &mut value);
                } else if ty.multiplicity == super::schema::Multiplicity::Simple {
                    // At most one edge per endpoint pair.
                    encode_varint(other.0, &mut column);
                    encode_varint(relation_id, &mut value);
                } else {
                    encode_varint(other.0, &mut column);
                    encode_varint(relation_id, &mut column);
                }
                value.extend_from_slice(payload);
            }
        }

        Ok(Entry::new(column.into(), value.into()))
    }

    /// Decode a column's head back to `(type, direction)`.
    pub fn decode_column(&self, column: &[u8]) -> Result<ColumnInfo, DecodeError> {
        if column.len() < TAG_LEN {
            return Err(DecodeError::BufferLength {
                needed: TAG_LEN,
                remaining: column.len(),
            });
        }
        let mut raw = [0u8; TAG_LEN];
        raw.copy_from_slice(&column[..TAG_LEN]);
        let tag = u64::from_be_bytes(raw);
        Ok(ColumnInfo {
            type_id: TypeId(tag >> 2),
            dir: DirCode::from_bits(tag & 0b11)?,
        })
    }

    /// Relation id of a SET-cardinality property entry (stored in the
    /// value). Used when reconciling index deletions.
    pub fn decode_set_property_relation_id(&self, entry: &Entry) -> Result<u64, DecodeError> {
        let mut reader: &[u8] = &entry.value;
        decode_varint(&mut reader)
    }

    /// The contiguous column range of `(type, direction)`.
    pub fn slice_query(&self, ty: &RelationTypeSchema, dir: Directionality) -> SliceQuery {
        let (lo, hi) = match ty.kind {
            TypeKind::PropertyKey => (0, 1),
            TypeKind::EdgeLabel => match dir {
                Directionality::Out => (1, 2),
                Directionality::In => (2, 3),
                Directionality::Both => (1, 3),
            },
        };
        SliceQuery::new(
            StaticBuffer::copy_from_slice(&tag_bytes(ty.id, lo)),
            StaticBuffer::copy_from_slice(&tag_bytes(ty.id, hi)),
        )
    }

    /// Narrow a type/direction slice to a sort-key interval. The interval
    /// bytes are appended to the range bounds, so they apply to views sorted
    /// by value.
    pub fn slice_query_interval(
        &self,
        ty: &RelationTypeSchema,
        dir: Directionality,
        interval: (&[u8], &[u8]),
    ) -> SliceQuery {
        let base = self.slice_query(ty, dir);
        let mut start = base.start.to_vec();
        start.extend_from_slice(interval.0);
        let mut end = base.start.to_vec();
        end.extend_from_slice(interval.1);
        SliceQuery::new(start.into(), end.into())
    }

    /// The singleton one-row existence slice: a key has an entry in this
    /// range iff it denotes a real vertex.
    pub fn vertex_existence_query(&self) -> SliceQuery {
        SliceQuery::new(
            StaticBuffer::copy_from_slice(&tag_bytes(system::VERTEX_EXISTS, 0)),
            StaticBuffer::copy_from_slice(&tag_bytes(system::VERTEX_EXISTS, 1)),
        )
        .with_limit(1)
    }
}

/// Entry written for the owning vertex of a relation, ignoring alternate
/// views. Convenience for log serialization.
pub fn primary_entry(
    codec: &EdgeCodec,
    graph: &TxGraph,
    relation: &Relation,
) -> Result<(VertexId, Entry), InvariantViolation> {
    let vertex = graph.vertex(relation.vertex(0)).id;
    let entry = codec.encode_relation(graph, relation, 0)?;
    Ok((vertex, entry))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::relation::{Lifecycle, PropertyValue};
    use crate::db::schema::Multiplicity;
    use crate::db::RelationId;
    use bytes::Bytes;
    use std::sync::Arc;

    fn graph_with_edge(multiplicity: Multiplicity) -> (TxGraph, crate::db::relation::RelationSlot) {
        let mut ty = RelationTypeSchema::edge_label(TypeId(700), "follows");
        ty.multiplicity = multiplicity;
        let mut graph = TxGraph::new();
        let u = graph.new_vertex(None, Lifecycle::New);
        let v = graph.new_vertex(None, Lifecycle::New);
        graph.vertex_mut(u).id = VertexId(10);
        graph.vertex_mut(v).id = VertexId(20);
        let e = graph.new_edge(Arc::new(ty), u, v, Bytes::from_static(b"w"), Lifecycle::New);
        graph.relation_mut(e).id = RelationId(77);
        (graph, e)
    }

    #[test]
    fn column_head_roundtrips() {
        let codec = EdgeCodec;
        let (graph, e) = graph_with_edge(Multiplicity::Multi);
        let rel = graph.relation(e).clone();

        let out = codec.encode_relation(&graph, &rel, 0).unwrap();
        let info = codec.decode_column(&out.column).unwrap();
        assert_eq!(info.type_id, TypeId(700));
        assert_eq!(info.dir, DirCode::EdgeOut);

        let inn = codec.encode_relation(&graph, &rel, 1).unwrap();
        assert_eq!(codec.decode_column(&inn.column).unwrap().dir, DirCode::EdgeIn);
    }

    #[test]
    fn slice_queries_cover_their_entries_only() {
        let codec = EdgeCodec;
        let (graph, e) = graph_with_edge(Multiplicity::Multi);
        let rel = graph.relation(e).clone();
        let out = codec.encode_relation(&graph, &rel, 0).unwrap();
        let inn = codec.encode_relation(&graph, &rel, 1).unwrap();

        let out_query = codec.slice_query(&rel.ty, Directionality::Out);
        assert!(out_query.contains(&out.column));
        assert!(!out_query.contains(&inn.column));

        let both_query = codec.slice_query(&rel.ty, Directionality::Both);
        assert!(both_query.contains(&out.column));
        assert!(both_query.contains(&inn.column));

        // Entries of a neighboring type stay outside.
        let other = RelationTypeSchema::edge_label(TypeId(701), "likes");
        let other_query = codec.slice_query(&other, Directionality::Both);
        assert!(!other_query.contains(&out.column));
    }

    #[test]
    fn unique_direction_collapses_the_column() {
        let codec = EdgeCodec;
        let (graph, e) = graph_with_edge(Multiplicity::Many2One);
        let rel = graph.relation(e).clone();

        // Unique in OUT: column is the bare tag.
        let out = codec.encode_relation(&graph, &rel, 0).unwrap();
        assert_eq!(out.column.len(), TAG_LEN);
        // Not unique in IN: the column also identifies the other endpoint
        // and the relation.
        let inn = codec.encode_relation(&graph, &rel, 1).unwrap();
        assert!(inn.column.len() > TAG_LEN);
    }

    #[test]
    fn property_cardinality_drives_column_shape() {
        let codec = EdgeCodec;
        let mut graph = TxGraph::new();
        let v = graph.new_vertex(None, Lifecycle::New);
        graph.vertex_mut(v).id = VertexId(5);

        let mut shapes = Vec::new();
        for cardinality in [Cardinality::Single, Cardinality::Set, Cardinality::List] {
            let mut ty = RelationTypeSchema::property(TypeId(900), "tag");
            ty.cardinality = cardinality;
            let p = graph.new_property(
                Arc::new(ty),
                v,
                PropertyValue::from("x"),
                Lifecycle::New,
            );
            graph.relation_mut(p).id = RelationId(5);
            let entry = codec
                .encode_relation(&graph, &graph.relation(p).clone(), 0)
                .unwrap();
            shapes.push(entry.column.len());
        }
        let (single, set, list) = (shapes[0], shapes[1], shapes[2]);
        assert_eq!(single, TAG_LEN);
        assert!(set > TAG_LEN);
        assert!(list > TAG_LEN);
    }

    #[test]
    fn existence_query_is_single_row() {
        let codec = EdgeCodec;
        let query = codec.vertex_existence_query();
        assert_eq!(query.limit, Some(1));

        let mut graph = TxGraph::new();
        let v = graph.new_vertex(None, Lifecycle::New);
        graph.vertex_mut(v).id = VertexId(3);
        let p = graph.new_property(
            Arc::new(system::vertex_exists()),
            v,
            PropertyValue::Bool(true),
            Lifecycle::New,
        );
        graph.relation_mut(p).id = RelationId(9);
        let entry = codec
            .encode_relation(&graph, &graph.relation(p).clone(), 0)
            .unwrap();
        assert!(query.contains(&entry.column));
    }

    #[test]
    fn unassigned_relation_id_is_rejected() {
        let codec = EdgeCodec;
        let (mut graph, e) = graph_with_edge(Multiplicity::Multi);
        graph.relation_mut(e).id = RelationId::UNASSIGNED;
        let rel = graph.relation(e).clone();
        assert_eq!(
            codec.encode_relation(&graph, &rel, 0).unwrap_err(),
            InvariantViolation::RelationIdUnassigned
        );
    }
}
