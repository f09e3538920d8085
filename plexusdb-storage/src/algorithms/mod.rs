//! Graph primitives operating on a [`Snapshot`](crate::snapshot::Snapshot):
//! shortest paths, variable-length path enumeration and PageRank.

mod centrality;
mod pathfinding;

pub use centrality::{PageRankOptions, PageRankResult, pagerank};
pub use pathfinding::{
    MAX_VAR_PATH_HOPS, Uniqueness, VarPathOptions, astar, bellman_ford,
    bfs_shortest_path, bidirectional_shortest_path, dijkstra, variable_paths,
};

use crate::snapshot::Snapshot;
use crate::{EdgeKey, Error, InternalNodeId, Result};

/// A found path: node sequence, the edges between them, and the total cost
/// (hop count for unweighted searches).
#[derive(Debug, Clone, PartialEq)]
pub struct PathResult {
    pub nodes: Vec<InternalNodeId>,
    pub edges: Vec<EdgeKey>,
    pub weight: f64,
}

impl PathResult {
    fn single(node: InternalNodeId) -> Self {
        Self { nodes: vec![node], edges: Vec::new(), weight: 0.0 }
    }

    #[inline]
    pub fn hops(&self) -> usize {
        self.edges.len()
    }
}

/// Edge weight for the weighted searches: the named edge property, absent
/// meaning 1. Non-numeric or non-finite values are rejected; negativity is
/// the caller's policy (`allow_negative` is set only by Bellman–Ford).
pub(crate) fn edge_weight(
    snapshot: &Snapshot,
    edge: EdgeKey,
    weight_key: Option<&str>,
    allow_negative: bool,
) -> Result<f64> {
    let Some(key) = weight_key else {
        return Ok(1.0);
    };
    let weight = match snapshot.edge_property(edge, key) {
        None => 1.0,
        Some(value) => value
            .as_f64()
            .ok_or(Error::InvalidWeight("weight property is not numeric"))?,
    };
    if !weight.is_finite() {
        return Err(Error::InvalidWeight("weight is not finite"));
    }
    if !allow_negative && weight < 0.0 {
        return Err(Error::InvalidWeight("negative weight"));
    }
    Ok(weight)
}
