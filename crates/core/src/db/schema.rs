//! Schema descriptors consumed by the commit pipeline.
//!
//! The engine does not manage schema; it receives fully-resolved
//! [`RelationTypeSchema`] entries (usually behind `Arc`) attached to the
//! relations of a transaction, plus the graph indexes covering them.

use std::sync::Arc;

use smallvec::SmallVec;

use super::relation::{Lifecycle, PropertyValue};
use super::{Entry, StaticBuffer, TypeId};

/// How many relations of a type may exist per vertex and direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Multiplicity {
    Many2One,
    One2Many,
    One2One,
    Simple,
    Multi,
}

/// The direction implied by a position within a relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Out,
    In,
}

impl Direction {
    pub fn from_position(position: usize) -> Self {
        if position == 0 {
            Direction::Out
        } else {
            Direction::In
        }
    }
}

impl Multiplicity {
    /// Whether at most one relation of this type may exist in `direction`
    /// per vertex. This is what makes a write a potential lost update.
    pub fn is_unique(self, direction: Direction) -> bool {
        match self {
            Multiplicity::Many2One => direction == Direction::Out,
            Multiplicity::One2Many => direction == Direction::In,
            Multiplicity::One2One => true,
            Multiplicity::Simple | Multiplicity::Multi => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directionality {
    Out,
    In,
    Both,
}

impl Directionality {
    /// Whether an entry is written under the vertex at `position`.
    pub fn covers_position(self, position: usize) -> bool {
        match self {
            Directionality::Out => position == 0,
            Directionality::In => position == 1,
            Directionality::Both => position <= 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    Single,
    Set,
    List,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsistencyModifier {
    Default,
    Lock,
    Fork,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaStatus {
    Enabled,
    Installed,
    Disabled,
    Registered,
}

/// Whether a type describes vertex properties or edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    PropertyKey,
    EdgeLabel,
}

/// One sort order of a relation type mirrored on every write: either the
/// canonical adjacency of the base type, or a relation index over it.
#[derive(Debug, Clone)]
pub struct RelationIndexView {
    /// The type id entries of this view are written under.
    pub as_type: TypeId,
    pub directionality: Directionality,
    pub status: SchemaStatus,
    /// Sort the view by the relation's value/payload instead of by id.
    pub sort_by_value: bool,
}

/// Schema entry describing how relations of one type are stored.
#[derive(Debug, Clone)]
pub struct RelationTypeSchema {
    pub id: TypeId,
    pub name: String,
    pub kind: TypeKind,
    pub multiplicity: Multiplicity,
    pub directionality: Directionality,
    pub cardinality: Cardinality,
    pub consistency: ConsistencyModifier,
    /// Time-to-live in seconds; 0 means none.
    pub ttl_seconds: u32,
    pub status: SchemaStatus,
    /// Whether this is a canonical (base) type. Base types on schema
    /// vertices constitute schema mutations.
    pub base: bool,
    /// Additional sort orders mirrored on write.
    pub relation_indexes: Vec<RelationIndexView>,
    /// Graph indexes (composite and mixed) covering this type.
    pub graph_indexes: Vec<Arc<GraphIndex>>,
}

impl RelationTypeSchema {
    /// A plain user property key with SINGLE cardinality.
    pub fn property(id: TypeId, name: &str) -> Self {
        Self {
            id,
            name: name.to_owned(),
            kind: TypeKind::PropertyKey,
            multiplicity: Multiplicity::Many2One,
            directionality: Directionality::Out,
            cardinality: Cardinality::Single,
            consistency: ConsistencyModifier::Default,
            ttl_seconds: 0,
            status: SchemaStatus::Enabled,
            base: false,
            relation_indexes: Vec::new(),
            graph_indexes: Vec::new(),
        }
    }

    /// A plain user edge label with MULTI multiplicity.
    pub fn edge_label(id: TypeId, name: &str) -> Self {
        Self {
            id,
            name: name.to_owned(),
            kind: TypeKind::EdgeLabel,
            multiplicity: Multiplicity::Multi,
            directionality: Directionality::Both,
            cardinality: Cardinality::Single,
            consistency: ConsistencyModifier::Default,
            ttl_seconds: 0,
            status: SchemaStatus::Enabled,
            base: false,
            relation_indexes: Vec::new(),
            graph_indexes: Vec::new(),
        }
    }

    /// The canonical view plus every declared relation index.
    pub fn views(&self) -> SmallVec<[RelationIndexView; 2]> {
        let mut views = SmallVec::with_capacity(1 + self.relation_indexes.len());
        views.push(RelationIndexView {
            as_type: self.id,
            directionality: self.directionality,
            status: self.status,
            sort_by_value: false,
        });
        views.extend(self.relation_indexes.iter().cloned());
        views
    }

    pub fn has_ttl(&self) -> bool {
        self.ttl_seconds > 0
    }
}

/// Reserved system types. Base types on schema vertices mark schema
/// mutations; `VERTEX_EXISTS` backs the existence scan of global reads.
pub mod system {
    use super::*;

    pub const VERTEX_EXISTS: TypeId = TypeId(1);
    pub const SCHEMA_NAME: TypeId = TypeId(2);
    pub const SCHEMA_DEFINITION: TypeId = TypeId(3);

    /// Highest reserved type id; user types start above it.
    pub const LAST_RESERVED: u64 = 255;

    fn base(id: TypeId, name: &str, multiplicity: Multiplicity, cardinality: Cardinality) -> RelationTypeSchema {
        RelationTypeSchema {
            id,
            name: name.to_owned(),
            kind: TypeKind::PropertyKey,
            multiplicity,
            directionality: Directionality::Out,
            cardinality,
            consistency: ConsistencyModifier::Lock,
            ttl_seconds: 0,
            status: SchemaStatus::Enabled,
            base: true,
            relation_indexes: Vec::new(),
            graph_indexes: Vec::new(),
        }
    }

    /// The property marking a key as a real vertex.
    pub fn vertex_exists() -> RelationTypeSchema {
        base(VERTEX_EXISTS, "system%vertexexists", Multiplicity::Many2One, Cardinality::Single)
    }

    /// Schema entry name, unique across the graph.
    pub fn schema_name() -> RelationTypeSchema {
        base(SCHEMA_NAME, "system%schemaname", Multiplicity::One2One, Cardinality::Single)
    }

    /// Serialized definition payload of a schema entry.
    pub fn schema_definition() -> RelationTypeSchema {
        base(SCHEMA_DEFINITION, "system%schemadefinition", Multiplicity::Many2One, Cardinality::Single)
    }
}

/// What a graph index is backed by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexBacking {
    /// Entries live in the engine's own key-column-value store; supports
    /// locking.
    Composite,
    /// Maintained by the named external backend; lock-free.
    Mixed { backend: String },
}

/// The element category an index covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementCategory {
    Vertex,
    Edge,
}

impl ElementCategory {
    /// Store name mixed-index documents of this category are filed under.
    pub fn store_name(self) -> &'static str {
        match self {
            ElementCategory::Vertex => "vertex",
            ElementCategory::Edge => "edge",
        }
    }
}

/// A secondary index over elements, keyed by one relation type.
#[derive(Debug, Clone)]
pub struct GraphIndex {
    pub id: u64,
    pub name: String,
    pub backing: IndexBacking,
    pub element: ElementCategory,
    pub consistency: ConsistencyModifier,
    pub status: SchemaStatus,
}

impl GraphIndex {
    pub fn is_composite(&self) -> bool {
        matches!(self.backing, IndexBacking::Composite)
    }

    pub fn mixed_backend(&self) -> Option<&str> {
        match &self.backing {
            IndexBacking::Mixed { backend } => Some(backend),
            IndexBacking::Composite => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexMutationKind {
    Addition,
    Deletion,
}

/// Lifecycle of the element owning an index update, as observed when the
/// update was derived. Mixed backends use this to distinguish document
/// creation from in-place update, and deletion of a field from deletion of
/// the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElementState {
    pub is_new: bool,
    pub is_removed: bool,
}

impl ElementState {
    pub fn of(lifecycle: Lifecycle) -> Self {
        Self {
            is_new: lifecycle.is_new(),
            is_removed: lifecycle.is_removed(),
        }
    }
}

/// One derived index mutation, routed by the commit engine.
#[derive(Debug, Clone)]
pub enum IndexUpdate {
    Composite {
        index: Arc<GraphIndex>,
        kind: IndexMutationKind,
        key: StaticBuffer,
        entry: Entry,
        element: ElementState,
        /// Cardinality of the keyed relation type; LIST keys never lock.
        key_cardinality: Cardinality,
        /// Derived from a schema relation; routed to the schema sub-transaction.
        schema_update: bool,
    },
    Mixed {
        index: Arc<GraphIndex>,
        kind: IndexMutationKind,
        doc_id: String,
        field: String,
        value: PropertyValue,
        element: ElementState,
        schema_update: bool,
    },
}

impl IndexUpdate {
    pub fn kind(&self) -> IndexMutationKind {
        match self {
            IndexUpdate::Composite { kind, .. } | IndexUpdate::Mixed { kind, .. } => *kind,
        }
    }

    pub fn is_composite(&self) -> bool {
        matches!(self, IndexUpdate::Composite { .. })
    }

    pub fn is_schema_update(&self) -> bool {
        match self {
            IndexUpdate::Composite { schema_update, .. } | IndexUpdate::Mixed { schema_update, .. } => *schema_update,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multiplicity_uniqueness() {
        assert!(Multiplicity::Many2One.is_unique(Direction::Out));
        assert!(!Multiplicity::Many2One.is_unique(Direction::In));
        assert!(Multiplicity::One2Many.is_unique(Direction::In));
        assert!(Multiplicity::One2One.is_unique(Direction::Out));
        assert!(Multiplicity::One2One.is_unique(Direction::In));
        assert!(!Multiplicity::Simple.is_unique(Direction::Out));
        assert!(!Multiplicity::Multi.is_unique(Direction::In));
    }

    #[test]
    fn views_lead_with_the_base_type() {
        let mut ty = RelationTypeSchema::edge_label(TypeId(300), "follows");
        ty.relation_indexes.push(RelationIndexView {
            as_type: TypeId(301),
            directionality: Directionality::Out,
            status: SchemaStatus::Installed,
            sort_by_value: true,
        });
        let views = ty.views();
        assert_eq!(views.len(), 2);
        assert_eq!(views[0].as_type, ty.id);
        assert_eq!(views[1].as_type, TypeId(301));
    }

    #[test]
    fn directionality_position_coverage() {
        assert!(Directionality::Out.covers_position(0));
        assert!(!Directionality::Out.covers_position(1));
        assert!(Directionality::In.covers_position(1));
        assert!(Directionality::Both.covers_position(0));
        assert!(Directionality::Both.covers_position(1));
    }
}
