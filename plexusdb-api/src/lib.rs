//! Public surface shared by the PlexusDB storage engine and its front-ends.
//!
//! Front-ends (query layers, bindings, maintenance tools) talk to the engine
//! through the [`GraphStore`] / [`GraphSnapshot`] traits so they never depend
//! on storage internals.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Caller-supplied stable node identifier.
pub type ExternalId = u64;

/// Dense engine-assigned node identifier. Never reused once handed out.
pub type InternalNodeId = u32;

/// Interned identifier shared by node labels and relation types.
///
/// Labels and relation types draw from a single id namespace on purpose:
/// the six-ordering edge indexes key on these ids, and splitting the
/// namespace produces silent cross-index mismatches.
pub type SymbolId = u32;

/// Alias kept for call sites that speak in label terms.
pub type LabelId = SymbolId;
/// Alias kept for call sites that speak in relation-type terms.
pub type RelTypeId = SymbolId;

/// A directed edge `(src)-[rel]->(dst)`, the unit fact of the graph.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct EdgeKey {
    pub src: InternalNodeId,
    pub rel: RelTypeId,
    pub dst: InternalNodeId,
}

/// Property value attached to a node or an edge.
///
/// `Null` doubles as the deletion sentinel in overlays: setting a key to
/// `Null` hides any older value until compaction drops the pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    List(Vec<PropertyValue>),
    Map(BTreeMap<String, PropertyValue>),
    /// UTC timestamp in milliseconds since the epoch.
    DateTime(i64),
}

impl PropertyValue {
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, PropertyValue::Null)
    }

    /// Numeric view used by weighted path algorithms.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PropertyValue::Int(i) => Some(*i as f64),
            PropertyValue::Float(f) => Some(*f),
            _ => None,
        }
    }
}

/// Label filter for node scans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelFilter {
    /// Node carries at least one of the given labels.
    Any(Vec<LabelId>),
    /// Node carries every one of the given labels.
    All(Vec<LabelId>),
}

/// A handle that can mint immutable read views.
pub trait GraphStore {
    type Snapshot: GraphSnapshot;

    fn snapshot(&self) -> Result<Self::Snapshot, <Self::Snapshot as GraphSnapshot>::Err>;
}

/// An immutable, consistent read view of the graph.
///
/// Every method is fallible: implementations may read and checksum pages on
/// demand, and corruption surfaces as `Err`, never as a truncated answer.
pub trait GraphSnapshot {
    type Err: std::error::Error + Send + Sync + 'static;

    /// Outgoing edges of `src`, optionally restricted to one relation type.
    fn neighbors(
        &self,
        src: InternalNodeId,
        rel: Option<RelTypeId>,
    ) -> Result<Vec<EdgeKey>, Self::Err>;

    /// Incoming edges of `dst`, optionally restricted to one relation type.
    fn incoming_neighbors(
        &self,
        dst: InternalNodeId,
        rel: Option<RelTypeId>,
    ) -> Result<Vec<EdgeKey>, Self::Err>;

    /// All live node ids, optionally filtered by label.
    fn nodes(&self, filter: Option<&LabelFilter>) -> Result<Vec<InternalNodeId>, Self::Err>;

    fn resolve_external(&self, external: ExternalId) -> Option<InternalNodeId>;

    fn external_of(&self, node: InternalNodeId) -> Option<ExternalId>;

    fn node_labels(&self, node: InternalNodeId) -> Vec<LabelId>;

    fn node_property(
        &self,
        node: InternalNodeId,
        key: &str,
    ) -> Result<Option<PropertyValue>, Self::Err>;

    fn edge_property(&self, edge: EdgeKey, key: &str)
    -> Result<Option<PropertyValue>, Self::Err>;

    fn symbol_id(&self, name: &str) -> Option<SymbolId>;

    fn symbol_name(&self, id: SymbolId) -> Option<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edge_key_orders_by_src_rel_dst() {
        let a = EdgeKey { src: 1, rel: 2, dst: 3 };
        let b = EdgeKey { src: 1, rel: 2, dst: 4 };
        let c = EdgeKey { src: 2, rel: 0, dst: 0 };
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn property_value_numeric_view() {
        assert_eq!(PropertyValue::Int(3).as_f64(), Some(3.0));
        assert_eq!(PropertyValue::Float(2.5).as_f64(), Some(2.5));
        assert_eq!(PropertyValue::String("x".into()).as_f64(), None);
        assert!(PropertyValue::Null.is_null());
    }
}
