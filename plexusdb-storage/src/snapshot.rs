//! Immutable read views.
//!
//! A snapshot pins a manifest epoch plus the run list, symbol table, id
//! table and durable property table that were published at its creation.
//! Reads merge the layers newest-first: L0 runs, then CSR segments with
//! manifest tombstones subtracted. Results are sort-order-stable so tests
//! can compare sequences directly.

use crate::idmap::IdMap;
use crate::property::PropertyTable;
use crate::readers::ReaderTicket;
use crate::segment::{Order, SegmentStore};
use crate::symbols::SymbolTable;
use crate::{
    EdgeKey, Error, ExternalId, InternalNodeId, LabelFilter, PropertyValue, RelTypeId, Result,
    SymbolId,
};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

/// A frozen MemTable: the immutable delta of one committed batch.
#[derive(Debug)]
pub struct L0Run {
    seq: u64,
    edges_by_src: BTreeMap<InternalNodeId, Vec<EdgeKey>>,
    edges_by_dst: BTreeMap<InternalNodeId, Vec<EdgeKey>>,
    tombstoned_nodes: BTreeSet<InternalNodeId>,
    tombstoned_edges: BTreeSet<EdgeKey>,
    node_props: BTreeMap<(InternalNodeId, String), PropertyValue>,
    edge_props: BTreeMap<(EdgeKey, String), PropertyValue>,
}

impl L0Run {
    pub(crate) fn new(
        seq: u64,
        edges_by_src: BTreeMap<InternalNodeId, Vec<EdgeKey>>,
        edges_by_dst: BTreeMap<InternalNodeId, Vec<EdgeKey>>,
        tombstoned_nodes: BTreeSet<InternalNodeId>,
        tombstoned_edges: BTreeSet<EdgeKey>,
        node_props: BTreeMap<(InternalNodeId, String), PropertyValue>,
        edge_props: BTreeMap<(EdgeKey, String), PropertyValue>,
    ) -> Self {
        Self {
            seq,
            edges_by_src,
            edges_by_dst,
            tombstoned_nodes,
            tombstoned_edges,
            node_props,
            edge_props,
        }
    }

    #[inline]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn is_empty(&self) -> bool {
        self.edges_by_src.is_empty()
            && self.tombstoned_nodes.is_empty()
            && self.tombstoned_edges.is_empty()
            && self.node_props.is_empty()
            && self.edge_props.is_empty()
    }

    pub fn edges_for_src(&self, src: InternalNodeId) -> &[EdgeKey] {
        self.edges_by_src.get(&src).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn edges_for_dst(&self, dst: InternalNodeId) -> &[EdgeKey] {
        self.edges_by_dst.get(&dst).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn iter_edges(&self) -> impl Iterator<Item = EdgeKey> + '_ {
        self.edges_by_src.values().flat_map(|v| v.iter().copied())
    }

    pub fn iter_tombstoned_nodes(&self) -> impl Iterator<Item = InternalNodeId> + '_ {
        self.tombstoned_nodes.iter().copied()
    }

    pub fn iter_tombstoned_edges(&self) -> impl Iterator<Item = EdgeKey> + '_ {
        self.tombstoned_edges.iter().copied()
    }

    pub fn tombstones_node(&self, node: InternalNodeId) -> bool {
        self.tombstoned_nodes.contains(&node)
    }

    /// `Some(Null)` means the property was deleted in this run.
    pub fn node_prop_delta(&self, node: InternalNodeId, key: &str) -> Option<&PropertyValue> {
        self.node_props.get(&(node, key.to_string()))
    }

    pub fn edge_prop_delta(&self, edge: EdgeKey, key: &str) -> Option<&PropertyValue> {
        self.edge_props.get(&(edge, key.to_string()))
    }

    pub fn iter_node_props(
        &self,
    ) -> impl Iterator<Item = (InternalNodeId, &String, &PropertyValue)> {
        self.node_props.iter().map(|((n, k), v)| (*n, k, v))
    }

    pub fn iter_edge_props(&self) -> impl Iterator<Item = (EdgeKey, &String, &PropertyValue)> {
        self.edge_props.iter().map(|((e, k), v)| (*e, k, v))
    }
}

#[derive(Debug)]
pub struct Snapshot {
    runs: Arc<Vec<Arc<L0Run>>>,
    store: Arc<SegmentStore>,
    symbols: Arc<SymbolTable>,
    ids: Arc<IdMap>,
    props: Arc<PropertyTable>,
    _ticket: ReaderTicket,
}

impl Snapshot {
    pub(crate) fn new(
        runs: Arc<Vec<Arc<L0Run>>>,
        store: Arc<SegmentStore>,
        symbols: Arc<SymbolTable>,
        ids: Arc<IdMap>,
        props: Arc<PropertyTable>,
        ticket: ReaderTicket,
    ) -> Self {
        Self { runs, store, symbols, ids, props, _ticket: ticket }
    }

    #[inline]
    pub fn epoch(&self) -> u64 {
        self.store.epoch()
    }

    /// Outgoing edges of `src`. Bound relation types expand on SPO, unbound
    /// on SOP; either way the primary is the source node.
    pub fn neighbors(
        &self,
        src: InternalNodeId,
        rel: Option<RelTypeId>,
    ) -> Result<NeighborIter> {
        let order = if rel.is_some() { Order::Spo } else { Order::Sop };
        self.expand(src, rel, order, Direction::Out)
    }

    /// Incoming edges of `dst`, expanding on OPS/OSP.
    pub fn incoming_neighbors(
        &self,
        dst: InternalNodeId,
        rel: Option<RelTypeId>,
    ) -> Result<NeighborIter> {
        let order = if rel.is_some() { Order::Ops } else { Order::Osp };
        self.expand(dst, rel, order, Direction::In)
    }

    fn expand(
        &self,
        anchor: InternalNodeId,
        rel: Option<RelTypeId>,
        order: Order,
        direction: Direction,
    ) -> Result<NeighborIter> {
        if self.ids.is_tombstoned(anchor) {
            return Ok(NeighborIter::empty());
        }

        let mut blocked_nodes: HashSet<InternalNodeId> = HashSet::new();
        let mut blocked_edges: HashSet<EdgeKey> = HashSet::new();
        let mut seen: HashSet<EdgeKey> = HashSet::new();
        let mut edges: Vec<EdgeKey> = Vec::new();

        for run in self.runs.iter() {
            blocked_nodes.extend(run.iter_tombstoned_nodes());
            blocked_edges.extend(run.iter_tombstoned_edges());
            if blocked_nodes.contains(&anchor) {
                return Ok(NeighborIter::new(edges));
            }

            let run_edges = match direction {
                Direction::Out => run.edges_for_src(anchor),
                Direction::In => run.edges_for_dst(anchor),
            };
            for e in run_edges {
                if self.admit(*e, rel, direction, &blocked_nodes, &blocked_edges, false)
                    && seen.insert(*e)
                {
                    edges.push(*e);
                }
            }
        }

        for e in self.store.scan_primary(order, anchor)? {
            if self.admit(e, rel, direction, &blocked_nodes, &blocked_edges, true)
                && seen.insert(e)
            {
                edges.push(e);
            }
        }

        Ok(NeighborIter::new(edges))
    }

    fn admit(
        &self,
        e: EdgeKey,
        rel: Option<RelTypeId>,
        direction: Direction,
        blocked_nodes: &HashSet<InternalNodeId>,
        blocked_edges: &HashSet<EdgeKey>,
        from_segment: bool,
    ) -> bool {
        if let Some(rel) = rel
            && e.rel != rel
        {
            return false;
        }
        let other = match direction {
            Direction::Out => e.dst,
            Direction::In => e.src,
        };
        if blocked_nodes.contains(&other) || self.ids.is_tombstoned(other) {
            return false;
        }
        if blocked_edges.contains(&e) {
            return false;
        }
        if from_segment && self.store.is_tombstoned(&e) {
            return false;
        }
        true
    }

    /// Resolve an arbitrary `(s?, p?, o?)` pattern against the ordering
    /// whose sort key makes it a prefix scan: SPO/SOP for bound subjects,
    /// POS for `p,o`, PSO for a bare `p`, OSP/OPS for bound objects.
    pub fn edges_matching(
        &self,
        src: Option<InternalNodeId>,
        rel: Option<RelTypeId>,
        dst: Option<InternalNodeId>,
    ) -> Result<Vec<EdgeKey>> {
        match (src, rel, dst) {
            (Some(s), _, _) => Ok(self
                .neighbors(s, rel)?
                .filter(|e| dst.is_none_or(|d| e.dst == d))
                .collect()),
            (None, Some(p), Some(o)) => {
                Ok(self
                    .rel_primary_scan(p, Order::Pos)?
                    .into_iter()
                    .filter(|e| e.dst == o)
                    .collect())
            }
            (None, Some(p), None) => self.rel_primary_scan(p, Order::Pso),
            (None, None, Some(o)) => Ok(self.incoming_neighbors(o, None)?.collect()),
            (None, None, None) => self.edges().collect(),
        }
    }

    /// Prefix scan over one of the predicate-primary orderings.
    fn rel_primary_scan(&self, rel: RelTypeId, order: Order) -> Result<Vec<EdgeKey>> {
        let mut blocked_nodes: HashSet<InternalNodeId> = HashSet::new();
        let mut blocked_edges: HashSet<EdgeKey> = HashSet::new();
        let mut seen: HashSet<EdgeKey> = HashSet::new();
        let mut edges: Vec<EdgeKey> = Vec::new();

        for run in self.runs.iter() {
            blocked_nodes.extend(run.iter_tombstoned_nodes());
            blocked_edges.extend(run.iter_tombstoned_edges());
            for e in run.iter_edges() {
                if e.rel == rel
                    && !blocked_nodes.contains(&e.src)
                    && !blocked_nodes.contains(&e.dst)
                    && !self.ids.is_tombstoned(e.src)
                    && !self.ids.is_tombstoned(e.dst)
                    && !blocked_edges.contains(&e)
                    && seen.insert(e)
                {
                    edges.push(e);
                }
            }
        }

        for e in self.store.scan_primary(order, rel)? {
            if !self.store.is_tombstoned(&e)
                && !blocked_nodes.contains(&e.src)
                && !blocked_nodes.contains(&e.dst)
                && !self.ids.is_tombstoned(e.src)
                && !self.ids.is_tombstoned(e.dst)
                && !blocked_edges.contains(&e)
                && seen.insert(e)
            {
                edges.push(e);
            }
        }
        Ok(edges)
    }

    /// Lazy scan over every live edge. Segment pages are read one at a time;
    /// corruption surfaces as an `Err` item and terminates the scan.
    pub fn edges(&self) -> EdgeScan<'_> {
        let mut blocked_nodes: HashSet<InternalNodeId> = HashSet::new();
        let mut blocked_edges: HashSet<EdgeKey> = HashSet::new();
        let mut run_edges: Vec<EdgeKey> = Vec::new();
        let mut run_edge_set: HashSet<EdgeKey> = HashSet::new();

        for run in self.runs.iter() {
            blocked_nodes.extend(run.iter_tombstoned_nodes());
            blocked_edges.extend(run.iter_tombstoned_edges());
            for e in run.iter_edges() {
                if blocked_nodes.contains(&e.src)
                    || blocked_nodes.contains(&e.dst)
                    || self.ids.is_tombstoned(e.src)
                    || self.ids.is_tombstoned(e.dst)
                    || blocked_edges.contains(&e)
                {
                    continue;
                }
                if run_edge_set.insert(e) {
                    run_edges.push(e);
                }
            }
        }

        let pages = self.store.order_pages(Order::Spo).to_vec();
        EdgeScan {
            snapshot: self,
            run_edges,
            run_edge_set,
            blocked_nodes,
            blocked_edges,
            pages,
            run_idx: 0,
            page_idx: 0,
            buffer: Vec::new(),
            buffer_idx: 0,
            failed: false,
        }
    }

    /// Live node ids, optionally filtered by label.
    pub fn nodes(&self, filter: Option<LabelFilter>) -> NodeIter<'_> {
        NodeIter {
            snapshot: self,
            filter,
            next: 0,
            len: self.ids.len() as u32,
        }
    }

    pub fn is_node_tombstoned(&self, node: InternalNodeId) -> bool {
        if self.ids.is_tombstoned(node) {
            return true;
        }
        self.runs.iter().any(|run| run.tombstones_node(node))
    }

    pub fn contains_edge(&self, e: EdgeKey) -> Result<bool> {
        Ok(self
            .neighbors(e.src, Some(e.rel))?
            .any(|found| found == e))
    }

    pub fn resolve_external(&self, external: ExternalId) -> Option<InternalNodeId> {
        let node = self.ids.lookup(external)?;
        (!self.is_node_tombstoned(node)).then_some(node)
    }

    pub fn external_of(&self, node: InternalNodeId) -> Option<ExternalId> {
        if self.is_node_tombstoned(node) {
            return None;
        }
        self.ids.external_of(node)
    }

    pub fn node_labels(&self, node: InternalNodeId) -> Vec<SymbolId> {
        self.ids.labels_of(node).to_vec()
    }

    pub fn symbol_id(&self, name: &str) -> Option<SymbolId> {
        self.symbols.id(name)
    }

    pub fn symbol_name(&self, id: SymbolId) -> Option<String> {
        self.symbols.name(id).map(str::to_string)
    }

    pub fn node_property(&self, node: InternalNodeId, key: &str) -> Option<PropertyValue> {
        for run in self.runs.iter() {
            if let Some(delta) = run.node_prop_delta(node, key) {
                return (!delta.is_null()).then(|| delta.clone());
            }
        }
        self.props.node_get(node, key).cloned()
    }

    pub fn edge_property(&self, edge: EdgeKey, key: &str) -> Option<PropertyValue> {
        for run in self.runs.iter() {
            if let Some(delta) = run.edge_prop_delta(edge, key) {
                return (!delta.is_null()).then(|| delta.clone());
            }
        }
        self.props.edge_get(edge, key).cloned()
    }

    /// All properties of a node with overlays applied, oldest to newest.
    pub fn node_properties(&self, node: InternalNodeId) -> BTreeMap<String, PropertyValue> {
        let mut merged: BTreeMap<String, PropertyValue> = self
            .props
            .node_entries(node)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for run in self.runs.iter().rev() {
            for (n, key, value) in run.iter_node_props() {
                if n != node {
                    continue;
                }
                if value.is_null() {
                    merged.remove(key);
                } else {
                    merged.insert(key.clone(), value.clone());
                }
            }
        }
        merged
    }

    pub fn edge_properties(&self, edge: EdgeKey) -> BTreeMap<String, PropertyValue> {
        let mut merged: BTreeMap<String, PropertyValue> = self
            .props
            .edge_entries(edge)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for run in self.runs.iter().rev() {
            for (e, key, value) in run.iter_edge_props() {
                if e != edge {
                    continue;
                }
                if value.is_null() {
                    merged.remove(key);
                } else {
                    merged.insert(key.clone(), value.clone());
                }
            }
        }
        merged
    }

    fn label_match(&self, node: InternalNodeId, filter: &LabelFilter) -> bool {
        let labels = self.ids.labels_of(node);
        match filter {
            LabelFilter::Any(wanted) => wanted.iter().any(|l| labels.contains(l)),
            LabelFilter::All(wanted) => wanted.iter().all(|l| labels.contains(l)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Out,
    In,
}

/// Restartable neighbor iterator. The underlying pages were already read and
/// CRC-verified at creation; iteration itself cannot fail.
#[derive(Debug)]
pub struct NeighborIter {
    edges: Vec<EdgeKey>,
    idx: usize,
}

impl NeighborIter {
    fn new(edges: Vec<EdgeKey>) -> Self {
        Self { edges, idx: 0 }
    }

    fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn restart(&mut self) {
        self.idx = 0;
    }

    pub fn remaining(&self) -> usize {
        self.edges.len() - self.idx
    }
}

impl Iterator for NeighborIter {
    type Item = EdgeKey;

    fn next(&mut self) -> Option<EdgeKey> {
        let e = self.edges.get(self.idx).copied()?;
        self.idx += 1;
        Some(e)
    }
}

/// Lazy full-graph edge scan; yields `Err` once on the first corrupt page.
pub struct EdgeScan<'a> {
    snapshot: &'a Snapshot,
    run_edges: Vec<EdgeKey>,
    run_edge_set: HashSet<EdgeKey>,
    blocked_nodes: HashSet<InternalNodeId>,
    blocked_edges: HashSet<EdgeKey>,
    pages: Vec<crate::manifest::PageRecord>,
    run_idx: usize,
    page_idx: usize,
    buffer: Vec<EdgeKey>,
    buffer_idx: usize,
    failed: bool,
}

impl Iterator for EdgeScan<'_> {
    type Item = Result<EdgeKey>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        if self.run_idx < self.run_edges.len() {
            let e = self.run_edges[self.run_idx];
            self.run_idx += 1;
            return Some(Ok(e));
        }

        loop {
            if self.buffer_idx < self.buffer.len() {
                let e = self.buffer[self.buffer_idx];
                self.buffer_idx += 1;

                if self.blocked_nodes.contains(&e.src)
                    || self.blocked_nodes.contains(&e.dst)
                    || self.snapshot.ids.is_tombstoned(e.src)
                    || self.snapshot.ids.is_tombstoned(e.dst)
                    || self.blocked_edges.contains(&e)
                    || self.snapshot.store.is_tombstoned(&e)
                    || self.run_edge_set.contains(&e)
                {
                    continue;
                }
                return Some(Ok(e));
            }

            if self.page_idx >= self.pages.len() {
                return None;
            }
            let rec = self.pages[self.page_idx];
            self.page_idx += 1;
            match self.snapshot.store.page_edges(Order::Spo, &rec) {
                Ok(edges) => {
                    self.buffer = edges;
                    self.buffer_idx = 0;
                }
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

/// Lazy node id scan over the dense id space.
pub struct NodeIter<'a> {
    snapshot: &'a Snapshot,
    filter: Option<LabelFilter>,
    next: u32,
    len: u32,
}

impl Iterator for NodeIter<'_> {
    type Item = InternalNodeId;

    fn next(&mut self) -> Option<InternalNodeId> {
        while self.next < self.len {
            let node = self.next;
            self.next += 1;

            if self.snapshot.is_node_tombstoned(node) {
                continue;
            }
            if let Some(filter) = &self.filter
                && !self.snapshot.label_match(node, filter)
            {
                continue;
            }
            return Some(node);
        }
        None
    }
}

impl plexusdb_api::GraphSnapshot for Snapshot {
    type Err = Error;

    fn neighbors(
        &self,
        src: InternalNodeId,
        rel: Option<RelTypeId>,
    ) -> std::result::Result<Vec<EdgeKey>, Error> {
        Ok(Snapshot::neighbors(self, src, rel)?.collect())
    }

    fn incoming_neighbors(
        &self,
        dst: InternalNodeId,
        rel: Option<RelTypeId>,
    ) -> std::result::Result<Vec<EdgeKey>, Error> {
        Ok(Snapshot::incoming_neighbors(self, dst, rel)?.collect())
    }

    fn nodes(
        &self,
        filter: Option<&LabelFilter>,
    ) -> std::result::Result<Vec<InternalNodeId>, Error> {
        Ok(Snapshot::nodes(self, filter.cloned()).collect())
    }

    fn resolve_external(&self, external: ExternalId) -> Option<InternalNodeId> {
        Snapshot::resolve_external(self, external)
    }

    fn external_of(&self, node: InternalNodeId) -> Option<ExternalId> {
        Snapshot::external_of(self, node)
    }

    fn node_labels(&self, node: InternalNodeId) -> Vec<SymbolId> {
        Snapshot::node_labels(self, node)
    }

    fn node_property(
        &self,
        node: InternalNodeId,
        key: &str,
    ) -> std::result::Result<Option<PropertyValue>, Error> {
        Ok(Snapshot::node_property(self, node, key))
    }

    fn edge_property(
        &self,
        edge: EdgeKey,
        key: &str,
    ) -> std::result::Result<Option<PropertyValue>, Error> {
        Ok(Snapshot::edge_property(self, edge, key))
    }

    fn symbol_id(&self, name: &str) -> Option<SymbolId> {
        Snapshot::symbol_id(self, name)
    }

    fn symbol_name(&self, id: SymbolId) -> Option<String> {
        Snapshot::symbol_name(self, id)
    }
}
