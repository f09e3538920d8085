use crate::snapshot::Snapshot;
use crate::{Result, SymbolId};
use serde::Serialize;
use std::collections::BTreeMap;

/// Coarse graph statistics, computed from a snapshot. Surfaced by the CLI
/// and usable as cardinality hints by query front-ends.
#[derive(Debug, Default, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphStatistics {
    pub total_nodes: u64,
    pub total_edges: u64,
    pub node_counts_by_label: BTreeMap<SymbolId, u64>,
    pub edge_counts_by_type: BTreeMap<SymbolId, u64>,
}

impl GraphStatistics {
    pub fn collect(snapshot: &Snapshot) -> Result<Self> {
        let mut stats = GraphStatistics::default();

        for node in snapshot.nodes(None) {
            stats.total_nodes += 1;
            for label in snapshot.node_labels(node) {
                *stats.node_counts_by_label.entry(label).or_default() += 1;
            }
        }

        for edge in snapshot.edges() {
            let edge = edge?;
            stats.total_edges += 1;
            *stats.edge_counts_by_type.entry(edge.rel).or_default() += 1;
        }

        Ok(stats)
    }
}
