//! PageRank over a snapshot.

use crate::snapshot::Snapshot;
use crate::{Error, InternalNodeId, RelTypeId, Result};
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct PageRankOptions {
    /// Probability of following a link instead of jumping randomly.
    pub damping: f64,
    pub max_iterations: usize,
    /// Stop once the L1 change of the score vector drops below this.
    pub tolerance: f64,
}

impl Default for PageRankOptions {
    fn default() -> Self {
        Self { damping: 0.85, max_iterations: 100, tolerance: 1e-6 }
    }
}

#[derive(Debug, Clone)]
pub struct PageRankResult {
    pub scores: HashMap<InternalNodeId, f64>,
    pub iterations: usize,
    pub converged: bool,
    /// L1 change of the final iteration.
    pub l1_change: f64,
}

pub fn pagerank(
    snapshot: &Snapshot,
    rel: Option<RelTypeId>,
    opts: PageRankOptions,
) -> Result<PageRankResult> {
    if !(0.0..=1.0).contains(&opts.damping) {
        return Err(Error::InvalidArgument("damping must lie in [0, 1]"));
    }
    if !(opts.tolerance > 0.0) {
        return Err(Error::InvalidArgument("tolerance must be positive"));
    }

    let nodes: Vec<InternalNodeId> = snapshot.nodes(None).collect();
    let n = nodes.len();
    if n == 0 {
        return Ok(PageRankResult {
            scores: HashMap::new(),
            iterations: 0,
            converged: true,
            l1_change: 0.0,
        });
    }

    let mut out_degree: HashMap<InternalNodeId, usize> = HashMap::new();
    let mut incoming: HashMap<InternalNodeId, Vec<InternalNodeId>> = HashMap::new();
    for e in snapshot.edges() {
        let e = e?;
        if let Some(rel) = rel
            && e.rel != rel
        {
            continue;
        }
        *out_degree.entry(e.src).or_default() += 1;
        incoming.entry(e.dst).or_default().push(e.src);
    }

    let initial = 1.0 / n as f64;
    let mut scores: HashMap<InternalNodeId, f64> =
        nodes.iter().map(|&id| (id, initial)).collect();
    let mut next: HashMap<InternalNodeId, f64> = HashMap::with_capacity(n);

    let random_jump = (1.0 - opts.damping) / n as f64;
    let mut iterations = 0;
    let mut converged = false;
    let mut l1_change = f64::MAX;

    for _ in 0..opts.max_iterations {
        iterations += 1;
        l1_change = 0.0;

        // Mass of nodes without outgoing links is spread evenly.
        let dangling: f64 = nodes
            .iter()
            .filter(|id| out_degree.get(id).is_none_or(|&d| d == 0))
            .map(|id| scores.get(id).copied().unwrap_or(0.0))
            .sum();
        let dangling_share = opts.damping * dangling / n as f64;

        for &node in &nodes {
            let mut link_mass = 0.0;
            if let Some(sources) = incoming.get(&node) {
                for source in sources {
                    let source_score = scores.get(source).copied().unwrap_or(0.0);
                    let degree = out_degree.get(source).copied().unwrap_or(1).max(1);
                    link_mass += source_score / degree as f64;
                }
            }

            let score = random_jump + dangling_share + opts.damping * link_mass;
            l1_change += (score - scores.get(&node).copied().unwrap_or(0.0)).abs();
            next.insert(node, score);
        }

        std::mem::swap(&mut scores, &mut next);
        next.clear();

        if l1_change < opts.tolerance {
            converged = true;
            break;
        }
    }

    // Normalize to a probability distribution.
    let total: f64 = scores.values().sum();
    if total > 0.0 {
        for score in scores.values_mut() {
            *score /= total;
        }
    }

    Ok(PageRankResult { scores, iterations, converged, l1_change })
}
