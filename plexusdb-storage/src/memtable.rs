//! The mutable in-memory delta of one open batch. Frozen into an immutable
//! [`L0Run`](crate::snapshot::L0Run) at commit.

use crate::snapshot::L0Run;
use crate::{EdgeKey, InternalNodeId, PropertyValue, RelTypeId};
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Debug, Default)]
pub struct MemTable {
    out: HashMap<InternalNodeId, BTreeSet<EdgeKey>>,
    tombstoned_nodes: BTreeSet<InternalNodeId>,
    tombstoned_edges: BTreeSet<EdgeKey>,
    /// `Null` values are deletion sentinels.
    node_props: BTreeMap<(InternalNodeId, String), PropertyValue>,
    edge_props: BTreeMap<(EdgeKey, String), PropertyValue>,
}

impl MemTable {
    pub fn add_edge(&mut self, src: InternalNodeId, rel: RelTypeId, dst: InternalNodeId) {
        let key = EdgeKey { src, rel, dst };
        // Re-adding after a delete in the same batch resurrects the edge.
        self.tombstoned_edges.remove(&key);
        self.out.entry(src).or_default().insert(key);
    }

    pub fn delete_edge(&mut self, src: InternalNodeId, rel: RelTypeId, dst: InternalNodeId) {
        let key = EdgeKey { src, rel, dst };
        if let Some(set) = self.out.get_mut(&src) {
            set.remove(&key);
            if set.is_empty() {
                self.out.remove(&src);
            }
        }
        self.tombstoned_edges.insert(key);
    }

    pub fn tombstone_node(&mut self, node: InternalNodeId) {
        self.tombstoned_nodes.insert(node);
    }

    pub fn set_node_property(&mut self, node: InternalNodeId, key: String, value: PropertyValue) {
        self.node_props.insert((node, key), value);
    }

    pub fn set_edge_property(&mut self, edge: EdgeKey, key: String, value: PropertyValue) {
        self.edge_props.insert((edge, key), value);
    }

    pub fn is_empty(&self) -> bool {
        self.out.is_empty()
            && self.tombstoned_nodes.is_empty()
            && self.tombstoned_edges.is_empty()
            && self.node_props.is_empty()
            && self.edge_props.is_empty()
    }

    pub fn iter_edges(&self) -> impl Iterator<Item = EdgeKey> + '_ {
        self.out.values().flat_map(|set| set.iter().copied())
    }

    pub fn iter_tombstoned_edges(&self) -> impl Iterator<Item = EdgeKey> + '_ {
        self.tombstoned_edges.iter().copied()
    }

    pub fn iter_tombstoned_nodes(&self) -> impl Iterator<Item = InternalNodeId> + '_ {
        self.tombstoned_nodes.iter().copied()
    }

    pub fn iter_node_props(
        &self,
    ) -> impl Iterator<Item = (InternalNodeId, &String, &PropertyValue)> {
        self.node_props.iter().map(|((n, k), v)| (*n, k, v))
    }

    pub fn iter_edge_props(&self) -> impl Iterator<Item = (EdgeKey, &String, &PropertyValue)> {
        self.edge_props.iter().map(|((e, k), v)| (*e, k, v))
    }

    pub fn freeze_into_run(self, seq: u64) -> L0Run {
        let mut edges_by_src: BTreeMap<InternalNodeId, Vec<EdgeKey>> = BTreeMap::new();
        let mut edges_by_dst: BTreeMap<InternalNodeId, Vec<EdgeKey>> = BTreeMap::new();
        for (src, edges) in self.out {
            for e in &edges {
                edges_by_dst.entry(e.dst).or_default().push(*e);
            }
            edges_by_src.insert(src, edges.into_iter().collect());
        }
        for list in edges_by_dst.values_mut() {
            list.sort_unstable();
        }

        L0Run::new(
            seq,
            edges_by_src,
            edges_by_dst,
            self.tombstoned_nodes,
            self.tombstoned_edges,
            self.node_props,
            self.edge_props,
        )
    }
}
