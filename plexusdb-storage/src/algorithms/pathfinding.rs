//! Shortest-path and path-enumeration algorithms.

use super::{PathResult, edge_weight};
use crate::snapshot::Snapshot;
use crate::{EdgeKey, Error, InternalNodeId, RelTypeId, Result};
use ordered_float::OrderedFloat;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};

/// Hard ceiling on variable-length path enumeration. Enumeration is
/// exponential in the hop count; anything beyond this is a caller bug.
pub const MAX_VAR_PATH_HOPS: usize = 64;

const DEFAULT_VAR_PATH_MAX: usize = 8;

/// Breadth-first shortest path through edges of one (or any) relation type.
pub fn bfs_shortest_path(
    snapshot: &Snapshot,
    src: InternalNodeId,
    dst: InternalNodeId,
    rel: Option<RelTypeId>,
    max_hops: Option<usize>,
) -> Result<Option<PathResult>> {
    if src == dst {
        return Ok(Some(PathResult::single(src)));
    }

    let mut visited: HashSet<InternalNodeId> = HashSet::from([src]);
    let mut prev: HashMap<InternalNodeId, EdgeKey> = HashMap::new();
    let mut queue: VecDeque<(InternalNodeId, usize)> = VecDeque::from([(src, 0)]);

    while let Some((current, depth)) = queue.pop_front() {
        if let Some(limit) = max_hops
            && depth >= limit
        {
            continue;
        }

        for e in snapshot.neighbors(current, rel)? {
            if !visited.insert(e.dst) {
                continue;
            }
            prev.insert(e.dst, e);
            if e.dst == dst {
                return Ok(Some(reconstruct(&prev, src, dst, None)));
            }
            queue.push_back((e.dst, depth + 1));
        }
    }

    Ok(None)
}

/// Bidirectional BFS. Expands the smaller frontier level by level; returns a
/// path of the same length as the plain BFS would find.
pub fn bidirectional_shortest_path(
    snapshot: &Snapshot,
    src: InternalNodeId,
    dst: InternalNodeId,
    rel: Option<RelTypeId>,
    max_hops: Option<usize>,
) -> Result<Option<PathResult>> {
    if src == dst {
        return Ok(Some(PathResult::single(src)));
    }

    let mut dist_f: HashMap<InternalNodeId, usize> = HashMap::from([(src, 0)]);
    let mut dist_b: HashMap<InternalNodeId, usize> = HashMap::from([(dst, 0)]);
    let mut prev_f: HashMap<InternalNodeId, EdgeKey> = HashMap::new();
    // Backward predecessors point towards dst: next_b[n] is the edge
    // (n)-[rel]->(m) on the path from n to dst.
    let mut next_b: HashMap<InternalNodeId, EdgeKey> = HashMap::new();
    let mut frontier_f: Vec<InternalNodeId> = vec![src];
    let mut frontier_b: Vec<InternalNodeId> = vec![dst];
    let mut depth_f = 0usize;
    let mut depth_b = 0usize;

    while !frontier_f.is_empty() && !frontier_b.is_empty() {
        if let Some(limit) = max_hops
            && depth_f + depth_b >= limit
        {
            return Ok(None);
        }

        let forward = frontier_f.len() <= frontier_b.len();
        if forward {
            depth_f += 1;
            let mut next_frontier = Vec::new();
            for &node in &frontier_f {
                for e in snapshot.neighbors(node, rel)? {
                    if dist_f.contains_key(&e.dst) {
                        continue;
                    }
                    dist_f.insert(e.dst, depth_f);
                    prev_f.insert(e.dst, e);
                    next_frontier.push(e.dst);
                }
            }
            frontier_f = next_frontier;
        } else {
            depth_b += 1;
            let mut next_frontier = Vec::new();
            for &node in &frontier_b {
                for e in snapshot.incoming_neighbors(node, rel)? {
                    if dist_b.contains_key(&e.src) {
                        continue;
                    }
                    dist_b.insert(e.src, depth_b);
                    next_b.insert(e.src, e);
                    next_frontier.push(e.src);
                }
            }
            frontier_b = next_frontier;
        }

        // The freshly expanded level may have met the opposite search.
        let meeting = dist_f
            .iter()
            .filter_map(|(node, df)| dist_b.get(node).map(|db| (*node, df + db)))
            .min_by_key(|(_, total)| *total);
        if let Some((meet, total)) = meeting {
            if let Some(limit) = max_hops
                && total > limit
            {
                return Ok(None);
            }
            return Ok(Some(stitch(&prev_f, &next_b, src, dst, meet)));
        }
    }

    Ok(None)
}

fn stitch(
    prev_f: &HashMap<InternalNodeId, EdgeKey>,
    next_b: &HashMap<InternalNodeId, EdgeKey>,
    src: InternalNodeId,
    dst: InternalNodeId,
    meet: InternalNodeId,
) -> PathResult {
    let mut edges: Vec<EdgeKey> = Vec::new();

    let mut current = meet;
    while current != src {
        let e = prev_f[&current];
        edges.push(e);
        current = e.src;
    }
    edges.reverse();

    let mut current = meet;
    while current != dst {
        let e = next_b[&current];
        edges.push(e);
        current = e.dst;
    }

    let mut nodes = vec![src];
    nodes.extend(edges.iter().map(|e| e.dst));
    PathResult { weight: edges.len() as f64, nodes, edges }
}

/// Dijkstra over non-negative weights read from `weight_key` (absent ⇒ 1).
pub fn dijkstra(
    snapshot: &Snapshot,
    src: InternalNodeId,
    dst: InternalNodeId,
    rel: Option<RelTypeId>,
    weight_key: Option<&str>,
    max_hops: Option<usize>,
) -> Result<Option<PathResult>> {
    astar(snapshot, src, dst, rel, weight_key, max_hops, |_| 0.0)
}

/// A* with a non-negative admissible heuristic. With `h ≡ 0` this is exactly
/// Dijkstra.
pub fn astar<H>(
    snapshot: &Snapshot,
    src: InternalNodeId,
    dst: InternalNodeId,
    rel: Option<RelTypeId>,
    weight_key: Option<&str>,
    max_hops: Option<usize>,
    heuristic: H,
) -> Result<Option<PathResult>>
where
    H: Fn(InternalNodeId) -> f64,
{
    if src == dst {
        return Ok(Some(PathResult::single(src)));
    }

    let h = |node: InternalNodeId| -> Result<f64> {
        let estimate = heuristic(node);
        if !estimate.is_finite() || estimate < 0.0 {
            return Err(Error::InvalidWeight("heuristic must be finite and non-negative"));
        }
        Ok(estimate)
    };

    let mut g: HashMap<InternalNodeId, f64> = HashMap::from([(src, 0.0)]);
    let mut hops: HashMap<InternalNodeId, usize> = HashMap::from([(src, 0)]);
    let mut prev: HashMap<InternalNodeId, EdgeKey> = HashMap::new();
    let mut heap: BinaryHeap<Reverse<(OrderedFloat<f64>, InternalNodeId)>> = BinaryHeap::new();
    heap.push(Reverse((OrderedFloat(h(src)?), src)));

    while let Some(Reverse((_, node))) = heap.pop() {
        let node_cost = match g.get(&node) {
            Some(cost) => *cost,
            None => continue,
        };
        if node == dst {
            return Ok(Some(reconstruct(&prev, src, dst, Some(node_cost))));
        }

        let node_hops = hops.get(&node).copied().unwrap_or(0);
        if let Some(limit) = max_hops
            && node_hops >= limit
        {
            continue;
        }

        for e in snapshot.neighbors(node, rel)? {
            let weight = edge_weight(snapshot, e, weight_key, false)?;
            let candidate = node_cost + weight;
            if g.get(&e.dst).is_none_or(|&current| candidate < current) {
                g.insert(e.dst, candidate);
                hops.insert(e.dst, node_hops + 1);
                prev.insert(e.dst, e);
                heap.push(Reverse((OrderedFloat(candidate + h(e.dst)?), e.dst)));
            }
        }
    }

    Ok(None)
}

/// Bellman–Ford: negative weights allowed, negative cycles rejected.
pub fn bellman_ford(
    snapshot: &Snapshot,
    src: InternalNodeId,
    dst: InternalNodeId,
    rel: Option<RelTypeId>,
    weight_key: Option<&str>,
) -> Result<Option<PathResult>> {
    if src == dst {
        return Ok(Some(PathResult::single(src)));
    }

    let node_count = snapshot.nodes(None).count();
    let mut edges: Vec<(EdgeKey, f64)> = Vec::new();
    for e in snapshot.edges() {
        let e = e?;
        if let Some(rel) = rel
            && e.rel != rel
        {
            continue;
        }
        edges.push((e, edge_weight(snapshot, e, weight_key, true)?));
    }

    let mut dist: HashMap<InternalNodeId, f64> = HashMap::from([(src, 0.0)]);
    let mut prev: HashMap<InternalNodeId, EdgeKey> = HashMap::new();

    for _ in 1..node_count.max(1) {
        let mut relaxed = false;
        for (e, w) in &edges {
            let Some(&base) = dist.get(&e.src) else { continue };
            let candidate = base + w;
            if dist.get(&e.dst).is_none_or(|&current| candidate < current) {
                dist.insert(e.dst, candidate);
                prev.insert(e.dst, *e);
                relaxed = true;
            }
        }
        if !relaxed {
            break;
        }
    }

    // One more pass: any further relaxation proves a reachable negative cycle.
    for (e, w) in &edges {
        if let Some(&base) = dist.get(&e.src)
            && dist.get(&e.dst).is_none_or(|&current| base + w < current)
        {
            return Err(Error::NegativeCycle);
        }
    }

    match dist.get(&dst) {
        Some(&cost) => Ok(Some(reconstruct(&prev, src, dst, Some(cost)))),
        None => Ok(None),
    }
}

/// Path uniqueness mode for variable-length expansion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Uniqueness {
    /// No node may repeat within one path.
    #[default]
    Node,
    /// No constraint; bounded only by the hop window.
    None,
}

#[derive(Debug, Clone)]
pub struct VarPathOptions {
    pub min_hops: usize,
    /// Must stay finite: defaults to 8, hard-capped at [`MAX_VAR_PATH_HOPS`].
    pub max_hops: usize,
    pub uniqueness: Uniqueness,
}

impl Default for VarPathOptions {
    fn default() -> Self {
        Self {
            min_hops: 1,
            max_hops: DEFAULT_VAR_PATH_MAX,
            uniqueness: Uniqueness::Node,
        }
    }
}

/// Enumerate all paths from `src` whose length lies in
/// `[min_hops, max_hops]`, in deterministic neighbor order.
pub fn variable_paths(
    snapshot: &Snapshot,
    src: InternalNodeId,
    rel: Option<RelTypeId>,
    opts: VarPathOptions,
) -> Result<Vec<Vec<EdgeKey>>> {
    if opts.min_hops > opts.max_hops {
        return Err(Error::InvalidArgument("min_hops exceeds max_hops"));
    }
    if opts.max_hops > MAX_VAR_PATH_HOPS {
        return Err(Error::PathHopLimitExceeded {
            requested: opts.max_hops,
            limit: MAX_VAR_PATH_HOPS,
        });
    }

    let mut paths = Vec::new();
    let mut path: Vec<EdgeKey> = Vec::new();
    let mut on_path: HashSet<InternalNodeId> = HashSet::from([src]);
    walk(snapshot, src, rel, &opts, &mut path, &mut on_path, &mut paths)?;
    Ok(paths)
}

fn walk(
    snapshot: &Snapshot,
    node: InternalNodeId,
    rel: Option<RelTypeId>,
    opts: &VarPathOptions,
    path: &mut Vec<EdgeKey>,
    on_path: &mut HashSet<InternalNodeId>,
    paths: &mut Vec<Vec<EdgeKey>>,
) -> Result<()> {
    if path.len() >= opts.max_hops {
        return Ok(());
    }

    for e in snapshot.neighbors(node, rel)? {
        if opts.uniqueness == Uniqueness::Node && on_path.contains(&e.dst) {
            continue;
        }

        path.push(e);
        on_path.insert(e.dst);
        if path.len() >= opts.min_hops {
            paths.push(path.clone());
        }
        walk(snapshot, e.dst, rel, opts, path, on_path, paths)?;
        on_path.remove(&e.dst);
        path.pop();
    }
    Ok(())
}

fn reconstruct(
    prev: &HashMap<InternalNodeId, EdgeKey>,
    src: InternalNodeId,
    dst: InternalNodeId,
    cost: Option<f64>,
) -> PathResult {
    let mut edges: Vec<EdgeKey> = Vec::new();
    let mut current = dst;
    while current != src {
        match prev.get(&current) {
            Some(e) => {
                edges.push(*e);
                current = e.src;
            }
            None => break,
        }
    }
    edges.reverse();

    let mut nodes = vec![src];
    nodes.extend(edges.iter().map(|e| e.dst));
    let weight = cost.unwrap_or(edges.len() as f64);
    PathResult { nodes, edges, weight }
}
